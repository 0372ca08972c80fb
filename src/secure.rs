//! # Secure Socket Hooks
//!
//! The core does not ship a TLS implementation; it provides the seam a
//! deployment plugs one into. A [`SecureTransform`] upgrades a freshly
//! connected or accepted TCP stream to an encrypted duplex stream; the
//! connection drives the upgrade inside its SecureHandshaking state, under
//! the secured timer.
//!
//! Both plain and upgraded connections flow through the same boxed
//! [`StreamBox`], so the rest of the core is agnostic to whether a transform
//! is configured.

use crate::error::Error;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe duplex byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// The stream type connections operate on.
pub type StreamBox = Box<dyn DuplexStream>;

/// Pluggable secure-socket factory.
///
/// Implementations typically wrap a TLS library: `handshake_client` performs
/// the client side of the handshake (with `server_name` available for SNI
/// and certificate verification), `handshake_server` the accepting side.
/// Errors are reported as `Error::Handshake` and stop the connection.
///
/// The transform operates on the boxed stream so it can run either directly
/// after connect or later, upgrading a Raw-state connection after an
/// application-level negotiation.
#[async_trait]
pub trait SecureTransform: Send + Sync {
    async fn handshake_client(
        &self,
        stream: StreamBox,
        server_name: &str,
    ) -> Result<StreamBox, Error>;

    async fn handshake_server(&self, stream: StreamBox) -> Result<StreamBox, Error>;
}
