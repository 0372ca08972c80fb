//! # Service Configuration
//!
//! One [`Configuration`] record per service instance. It carries the
//! protocol, the optional server (listener) and client (connecting) sides,
//! per-pool caps, the four connection timers, buffer capacities, the
//! writer/reader limits, and the pluggable hooks: compression, secure
//! transform, relay engine, recipient-name extraction, and the grouped
//! connection/pool callbacks.
//!
//! All knobs have working defaults; a minimal server is
//! `Configuration::new(proto).with_listener("0.0.0.0:0")` and a minimal
//! client is `Configuration::new(proto).with_resolver(...)`.

use crate::error::Error;
use crate::packet::CompressionHooks;
use crate::protocol::Protocol;
use crate::relay::RelayEngine;
use crate::resolver::Resolver;
use crate::secure::SecureTransform;
use crate::service::{ConnectionContext, PoolEvent};
use std::sync::Arc;
use std::time::Duration;

/// State a connection starts in once the transport (and optional secure
/// handshake) is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opaque byte exchange; the protocol reader/writer are not engaged.
    Raw,
    /// Protocol engaged, drain-only; no new messages admitted.
    Passive,
    /// Fully usable.
    Active,
}

/// Grouped connection lifecycle callbacks.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    /// Invoked once the connection reaches its start state.
    pub on_start: Option<Arc<dyn Fn(&mut ConnectionContext) + Send + Sync>>,
    /// Invoked exactly once when the connection stops; the error is absent
    /// on a clean local close.
    pub on_stop: Option<Arc<dyn Fn(&mut ConnectionContext, Option<&Error>) + Send + Sync>>,
    /// Invoked on state-change events.
    pub on_event: Option<Arc<dyn Fn(&mut ConnectionContext, ConnectionEvent) + Send + Sync>>,
}

/// Connection state-change notifications delivered through
/// [`ConnectionHooks::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    SecureHandshakeComplete,
    EnteredRaw,
    EnteredPassive,
    EnteredActive,
}

/// Writer-side limits.
#[derive(Debug, Clone)]
pub struct WriterConfiguration {
    /// Maximum concurrently serializing messages per connection.
    pub max_message_count_multiplex: usize,
    /// Maximum requests awaiting a response per connection.
    pub max_message_count_response_wait: usize,
    /// Per-message serialized size cap; one byte over fails the message with
    /// `Error::TooLarge`.
    pub max_message_size: usize,
}

impl Default for WriterConfiguration {
    fn default() -> Self {
        WriterConfiguration {
            max_message_count_multiplex: 64,
            max_message_count_response_wait: 128,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Reader-side limits.
#[derive(Debug, Clone)]
pub struct ReaderConfiguration {
    /// Maximum concurrent reassemblies per connection; exceeding it fails
    /// the connection.
    pub max_message_count_multiplex: usize,
    /// Per-message reassembled size cap.
    pub max_message_size: usize,
}

impl Default for ReaderConfiguration {
    fn default() -> Self {
        ReaderConfiguration {
            max_message_count_multiplex: 64,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Listener-side configuration.
#[derive(Clone)]
pub struct ServerConfiguration {
    /// "host:port"; port 0 binds an ephemeral port, reported through
    /// `ServiceStartStatus`.
    pub listener_addr: String,
    pub connection_start_state: ConnectionState,
    pub connection_start_secure: bool,
    /// A connection configured to activate must reach Active within this
    /// interval or it is stopped with `SecuredTimeout`.
    pub timeout_activation: Duration,
    /// Upper bound for the secure handshake itself.
    pub timeout_secured: Duration,
}

impl ServerConfiguration {
    pub fn new(listener_addr: impl Into<String>) -> Self {
        ServerConfiguration {
            listener_addr: listener_addr.into(),
            connection_start_state: ConnectionState::Active,
            connection_start_secure: false,
            timeout_activation: Duration::from_secs(60),
            timeout_secured: Duration::from_secs(20),
        }
    }
}

/// Connecting-side configuration.
#[derive(Clone)]
pub struct ClientConfiguration {
    pub resolver: Arc<dyn Resolver>,
    pub connection_start_state: ConnectionState,
    pub connection_start_secure: bool,
    /// Resolution re-requests before queued messages fail with
    /// `Error::Resolver`.
    pub resolve_retry_count: u32,
}

impl ClientConfiguration {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        ClientConfiguration {
            resolver,
            connection_start_state: ConnectionState::Active,
            connection_start_secure: false,
            resolve_retry_count: 3,
        }
    }
}

/// The per-service configuration record.
#[derive(Clone)]
pub struct Configuration {
    pub protocol: Arc<Protocol>,
    pub server: Option<ServerConfiguration>,
    pub client: Option<ClientConfiguration>,

    // Pool caps.
    pub pool_max_active_connection_count: usize,
    pub pool_max_pending_connection_count: usize,
    pub pool_max_message_queue_size: usize,

    // Connection timers.
    pub reconnect_timeout: Duration,
    pub inactivity_timeout: Duration,
    /// Zero disables keep-alive emission.
    pub keepalive_timeout: Duration,
    /// Server error threshold: more consecutive keep-alives than this inside
    /// one inactivity window fail the connection.
    pub inactivity_keepalive_count: usize,

    // Buffer capacities; the receive buffer grows within [start, max] under
    // backpressure.
    pub recv_buffer_start_capacity: usize,
    pub recv_buffer_max_capacity: usize,
    pub send_buffer_start_capacity: usize,
    pub send_buffer_max_capacity: usize,

    pub writer: WriterConfiguration,
    pub reader: ReaderConfiguration,

    // Pluggable seams.
    pub compression: Option<CompressionHooks>,
    pub secure: Option<Arc<dyn SecureTransform>>,
    pub relay: Option<Arc<dyn RelayEngine>>,
    /// Normalizes a recipient URL to the pool key; identity when absent.
    pub extract_recipient_name_fnc: Option<Arc<dyn Fn(&str) -> String + Send + Sync>>,

    pub connection_hooks: ConnectionHooks,
    pub on_pool_event: Option<Arc<dyn Fn(&str, PoolEvent) + Send + Sync>>,

    /// Local network id carried in Connect packets.
    pub network_id: u32,
}

impl Configuration {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        Configuration {
            protocol,
            server: None,
            client: None,
            pool_max_active_connection_count: 1,
            pool_max_pending_connection_count: 2,
            pool_max_message_queue_size: 1024,
            reconnect_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(60 * 5),
            keepalive_timeout: Duration::from_secs(60 * 2),
            inactivity_keepalive_count: 32,
            recv_buffer_start_capacity: 8 * 1024,
            recv_buffer_max_capacity: 128 * 1024,
            send_buffer_start_capacity: 8 * 1024,
            send_buffer_max_capacity: 128 * 1024,
            writer: WriterConfiguration::default(),
            reader: ReaderConfiguration::default(),
            compression: None,
            secure: None,
            relay: None,
            extract_recipient_name_fnc: None,
            connection_hooks: ConnectionHooks::default(),
            on_pool_event: None,
            network_id: 0,
        }
    }

    pub fn with_listener(mut self, addr: impl Into<String>) -> Self {
        self.server = Some(ServerConfiguration::new(addr));
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.client = Some(ClientConfiguration::new(resolver));
        self
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn is_client(&self) -> bool {
        self.client.is_some()
    }

    /// Pool key for a recipient URL.
    pub(crate) fn recipient_name(&self, url: &str) -> String {
        match &self.extract_recipient_name_fnc {
            Some(f) => f(url),
            None => url.to_owned(),
        }
    }

    /// Validate cap relations before start.
    pub fn check(&self) -> Result<(), Error> {
        if self.server.is_none() && self.client.is_none() {
            return Err(Error::NotConfigured("neither server nor client"));
        }
        if self.recv_buffer_start_capacity > self.recv_buffer_max_capacity
            || self.send_buffer_start_capacity > self.send_buffer_max_capacity
        {
            return Err(Error::BadState("buffer start capacity exceeds max"));
        }
        if self.recv_buffer_start_capacity < crate::packet::PACKET_CAPACITY {
            return Err(Error::BadState("recv buffer smaller than one packet"));
        }
        if self.writer.max_message_count_multiplex == 0
            || self.reader.max_message_count_multiplex == 0
        {
            return Err(Error::BadState("multiplex cap must be nonzero"));
        }
        if self.pool_max_active_connection_count == 0 {
            return Err(Error::BadState("pool must allow at least one connection"));
        }
        Ok(())
    }

    /// Delay before the next client reconnect attempt.
    ///
    /// Exponential from `reconnect_timeout`, doubling per retry to a 16x
    /// cap. A previous attempt that reached Active restarts the schedule; a
    /// connection that at least reached the connected state halves the
    /// current step.
    pub(crate) fn reconnect_delay(
        &self,
        retry_count: u32,
        last_was_connected: bool,
        last_was_active: bool,
        _last_was_secured: bool,
    ) -> Duration {
        if last_was_active {
            return self.reconnect_timeout;
        }
        let exp = retry_count.min(4);
        let mut delay = self.reconnect_timeout.saturating_mul(1u32 << exp);
        if last_was_connected {
            delay /= 2;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DnsResolver;

    fn proto() -> Arc<Protocol> {
        Arc::new(Protocol::new(1, 0))
    }

    #[test]
    fn check_requires_a_role() {
        let cfg = Configuration::new(proto());
        assert!(matches!(cfg.check(), Err(Error::NotConfigured(_))));
        assert!(Configuration::new(proto())
            .with_listener("127.0.0.1:0")
            .check()
            .is_ok());
        assert!(Configuration::new(proto())
            .with_resolver(Arc::new(DnsResolver::new()))
            .check()
            .is_ok());
    }

    #[test]
    fn check_rejects_inverted_buffer_caps() {
        let mut cfg = Configuration::new(proto()).with_listener("127.0.0.1:0");
        cfg.recv_buffer_start_capacity = 64 * 1024;
        cfg.recv_buffer_max_capacity = 8 * 1024;
        assert!(cfg.check().is_err());
    }

    #[test]
    fn reconnect_schedule_is_exponential_and_capped() {
        let cfg = Configuration::new(proto()).with_listener("127.0.0.1:0");
        let base = cfg.reconnect_timeout;

        assert_eq!(cfg.reconnect_delay(0, false, false, false), base);
        assert_eq!(cfg.reconnect_delay(1, false, false, false), base * 2);
        assert_eq!(cfg.reconnect_delay(4, false, false, false), base * 16);
        // Capped past retry 4.
        assert_eq!(cfg.reconnect_delay(10, false, false, false), base * 16);
        // A previously active connection restarts the schedule.
        assert_eq!(cfg.reconnect_delay(10, true, true, false), base);
        // A connect that got through halves the step.
        assert_eq!(cfg.reconnect_delay(2, true, false, false), base * 2);
    }

    #[test]
    fn recipient_name_extraction_hook() {
        let mut cfg = Configuration::new(proto()).with_listener("127.0.0.1:0");
        assert_eq!(cfg.recipient_name("alpha:4242"), "alpha:4242");
        cfg.extract_recipient_name_fnc = Some(Arc::new(|url: &str| {
            url.split('/').next().unwrap_or(url).to_owned()
        }));
        assert_eq!(cfg.recipient_name("alpha:4242/path"), "alpha:4242");
    }
}
