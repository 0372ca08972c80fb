//! # Error Types
//!
//! Every failure the core can report is a variant of [`Error`], grouped the
//! way it propagates:
//!
//! - **Connection-scoped** errors stop the connection. They are reported once
//!   through the `on_connection_stop` callback and then once more per
//!   queued/in-flight message as the connection drains.
//! - **Message-scoped** errors complete a single message and leave the
//!   connection running.
//! - **Pool-scoped** errors are returned synchronously from the send call.
//! - **Relay-scoped** errors affect a single forwarded packet or session.

use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the RPC core.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // --- connection scoped -------------------------------------------------
    /// Name resolution failed after all retries.
    #[error("name resolution failed: {0}")]
    Resolver(String),

    /// The connect attempt did not complete within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The peer refused the connection.
    #[error("connect refused: {0}")]
    ConnectRefused(String),

    /// The listener could not be bound.
    #[error("listen failed: {0}")]
    Listen(String),

    /// The secure handshake failed.
    #[error("secure handshake failed: {0}")]
    Handshake(String),

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A socket read failed.
    #[error("read error: {0}")]
    ReadError(Arc<std::io::Error>),

    /// A socket write failed.
    #[error("write error: {0}")]
    WriteError(Arc<std::io::Error>),

    /// A message body failed to decode.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The packet stream is corrupt; the connection cannot continue.
    #[error("frame error: {0}")]
    FrameError(&'static str),

    /// The server received more consecutive keep-alive packets during an
    /// inactivity window than the configured limit allows.
    #[error("too many keep-alive packets received")]
    TooManyKeepalive,

    /// No inbound traffic for the configured inactivity interval.
    #[error("connection inactive for too long")]
    InactivityTimeout,

    /// The connection did not reach the Active state within the secured
    /// timeout while configured to do so.
    #[error("activation timed out")]
    SecuredTimeout,

    /// The peer opened more concurrent message reassemblies than the
    /// reader multiplex cap allows.
    #[error("too many multiplexed messages")]
    TooManyMultiplexedMessages,

    /// The connection was stopped while the message was queued or in flight.
    #[error("connection closed")]
    ConnectionClosed,

    // --- message scoped ----------------------------------------------------
    /// The serialized message exceeds the configured per-message cap.
    #[error("message too large")]
    TooLarge,

    /// The message type id is not registered with the protocol.
    #[error("unknown message type {0}")]
    TypeUnknown(u16),

    /// The message was canceled by the caller.
    #[error("message canceled")]
    Canceled,

    /// Serialization of an outgoing message body failed.
    #[error("serialize error: {0}")]
    SerializeError(String),

    // --- pool scoped -------------------------------------------------------
    /// The pool is shutting down and admits no new messages.
    #[error("pool is stopping")]
    PoolStopping,

    /// No connection pool exists for the recipient and none can be created.
    #[error("no connection pool for recipient")]
    NoPool,

    /// No usable connection and the pool cannot create one under its caps.
    #[error("no connection available")]
    NoConnection,

    /// The pool's pending message queue is full.
    #[error("pool message queue is full")]
    QueueFull,

    /// The operation is not valid in the target's current state.
    #[error("invalid state: {0}")]
    BadState(&'static str),

    /// The service is not configured for the requested role.
    #[error("service not configured: {0}")]
    NotConfigured(&'static str),

    // --- relay scoped ------------------------------------------------------
    /// A relayed packet referenced a relay session the engine does not know.
    #[error("unknown relay session")]
    RelayUnknownSession,

    /// A relayed packet id was already forwarded on this session.
    #[error("duplicate relayed packet")]
    RelayDuplicatePacket,

    /// The relay destination is gone or its queue is unusable.
    #[error("relay forward failed")]
    RelayForwardFailed,

    /// No connection is registered under the requested relay name.
    #[error("no relay destination named {0:?}")]
    RelayUnknownName(String),
}

impl Error {
    /// Whether the error stops the whole connection, as opposed to failing a
    /// single message or being returned synchronously from a send call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Resolver(_)
                | Error::ConnectTimeout
                | Error::ConnectRefused(_)
                | Error::Handshake(_)
                | Error::PeerClosed
                | Error::ReadError(_)
                | Error::WriteError(_)
                | Error::FrameError(_)
                | Error::TooManyKeepalive
                | Error::InactivityTimeout
                | Error::SecuredTimeout
                | Error::TooManyMultiplexedMessages
        )
    }

    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::PeerClosed
        } else {
            Error::ReadError(Arc::new(err))
        }
    }

    pub(crate) fn from_write(err: std::io::Error) -> Self {
        Error::WriteError(Arc::new(err))
    }

    pub(crate) fn from_connect(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::ConnectTimeout,
            _ => Error::ConnectRefused(err.to_string()),
        }
    }
}
