//! # Name Resolution
//!
//! Pools resolve recipient names to socket addresses through a pluggable
//! async [`Resolver`]. Resolution runs off the connection actors (the
//! default implementation defers to tokio's thread-pool backed
//! `lookup_host`), and each connect attempt draws the next address from the
//! resolved vector.

use crate::error::Error;
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::debug;

/// Asynchronous recipient-name resolver.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `name` ("host:port" or an application-defined name) to one or
    /// more candidate addresses, in preference order.
    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>, Error>;
}

/// Default resolver: system DNS via `tokio::net::lookup_host`, with an
/// optional default port applied to names that carry none.
pub struct DnsResolver {
    default_port: Option<u16>,
}

impl DnsResolver {
    pub fn new() -> Self {
        DnsResolver { default_port: None }
    }

    /// Apply `port` to recipient names that do not carry a `:port` suffix.
    pub fn with_default_port(port: u16) -> Self {
        DnsResolver {
            default_port: Some(port),
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>, Error> {
        let query: std::borrow::Cow<'_, str> = match (self.default_port, name.rfind(':')) {
            // Already has a port (a colon past any IPv6 brackets).
            (_, Some(pos)) if name[pos..].len() > 1 && name[pos + 1..].chars().all(|c| c.is_ascii_digit()) => {
                name.into()
            }
            (Some(port), _) => format!("{}:{}", name, port).into(),
            (None, _) => name.into(),
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(query.as_ref())
            .await
            .map_err(|e| Error::Resolver(format!("{}: {}", name, e)))?
            .collect();
        debug!(name, count = addrs.len(), "resolved recipient");
        if addrs.is_empty() {
            return Err(Error::Resolver(format!("{}: no addresses", name)));
        }
        Ok(addrs)
    }
}

/// Fixed-table resolver for tests and static topologies.
pub struct StaticResolver {
    entries: Vec<(String, Vec<SocketAddr>)>,
}

impl StaticResolver {
    pub fn new(entries: Vec<(String, Vec<SocketAddr>)>) -> Self {
        StaticResolver { entries }
    }

    /// Resolve every name to the same single address.
    pub fn single(addr: SocketAddr) -> Self {
        StaticResolver {
            entries: vec![(String::new(), vec![addr])],
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>, Error> {
        for (entry_name, addrs) in &self.entries {
            if entry_name.is_empty() || entry_name == name {
                return Ok(addrs.clone());
            }
        }
        Err(Error::Resolver(format!("{}: not in static table", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dns_resolves_loopback() {
        let resolver = DnsResolver::new();
        let addrs = resolver.resolve("127.0.0.1:4444").await.unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].port(), 4444);
    }

    #[tokio::test]
    async fn dns_applies_default_port() {
        let resolver = DnsResolver::with_default_port(9000);
        let addrs = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs[0].port(), 9000);
    }

    #[tokio::test]
    async fn static_table_lookup() {
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let resolver = StaticResolver::new(vec![("alpha".to_owned(), vec![addr])]);
        assert_eq!(resolver.resolve("alpha").await.unwrap(), vec![addr]);
        assert!(resolver.resolve("beta").await.is_err());
    }
}
