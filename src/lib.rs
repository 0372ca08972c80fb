//! # mprpc
//!
//! An asynchronous, pool-based message-passing RPC framework. Typed,
//! versioned messages are multiplexed as framed packets over TCP; a
//! per-recipient connection pool multiplexes many logical messages over
//! many physical connections, a listener accepts and upgrades inbound
//! connections symmetrically, and a relay engine forwards framed packets
//! between connections without touching message bodies.
//!
//! ## Quick tour
//!
//! ```no_run
//! use mprpc::{Configuration, DnsResolver, Protocol, Service};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Echo {
//!     text: String,
//! }
//!
//! # async fn run() -> Result<(), mprpc::Error> {
//! // Server: register the type with a receive handler that echoes back.
//! let mut proto = Protocol::new(1, 0);
//! proto
//!     .register::<Echo>(1, "Echo")
//!     .with_receive(|ctx, echo: Echo| {
//!         let _ = ctx.service().send_response(ctx, echo);
//!     });
//! let server = Service::start(
//!     Configuration::new(Arc::new(proto)).with_listener("127.0.0.1:0"),
//! )
//! .await?;
//! let addr = server.start_status().listen_addrs[0];
//!
//! // Client: send a request and await its completion callback.
//! let mut proto = Protocol::new(1, 0);
//! proto.register::<Echo>(1, "Echo");
//! let client = Service::start(
//!     Configuration::new(Arc::new(proto))
//!         .with_resolver(Arc::new(DnsResolver::new())),
//! )
//! .await?;
//! client.send_request(
//!     addr.to_string().as_str(),
//!     Echo { text: "hello".into() },
//!     |_ctx, _sent, recv: Option<Echo>, _err| {
//!         println!("echoed: {:?}", recv);
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! caller ──▶ Service ──▶ Pool ──▶ Connection ──▶ Writer ──▶ Codec ──▶ socket
//! socket ──▶ Codec ──▶ Reader ──▶ dispatch (receive / complete hooks)
//! relay:     Codec ──▶ RelayEngine ──▶ destination Connection (no decode)
//! ```
//!
//! Every connection, listener, and pool coordinator is a tokio task: an
//! actor that runs one handler at a time; cross-actor communication happens
//! only through posted commands and callbacks carrying an explicit
//! [`ConnectionContext`].

pub mod config;
pub mod error;
pub mod message;
pub mod packet;
pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod secure;
pub mod service;
pub mod statistics;

mod connection;
mod pool;
mod reader;
mod writer;

pub use config::{
    ClientConfiguration, Configuration, ConnectionEvent, ConnectionHooks, ConnectionState,
    ReaderConfiguration, ServerConfiguration, WriterConfiguration,
};
pub use connection::{NotifyFn, RawRecvFn};
pub use error::Error;
pub use message::{MessageFlags, MessageId, RecipientId};
pub use packet::CompressionHooks;
pub use protocol::Protocol;
pub use relay::{BasicRelayEngine, RelayEngine};
pub use resolver::{DnsResolver, Resolver, StaticResolver};
pub use secure::{SecureTransform, StreamBox};
pub use service::{
    ConnectionContext, PoolEvent, RecipientTarget, Service, ServiceStartStatus,
};
pub use statistics::StatisticSnapshot;

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// On-wire packet capacity, header included.
    pub const PACKET_CAPACITY: usize = crate::packet::PACKET_CAPACITY;

    /// Default per-message size cap.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Default concurrent in-flight messages per direction per connection.
    pub const MESSAGE_COUNT_MULTIPLEX: usize = 64;

    /// Default base delay of the reconnect schedule.
    pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default idle-incoming interval after which a connection is failed.
    pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60 * 5);

    /// Default idle-outgoing interval after which a keep-alive is sent.
    pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60 * 2);
}
