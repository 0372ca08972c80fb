//! # Service Statistics
//!
//! Cheap atomic counters the service maintains as traffic flows; a
//! [`StatisticSnapshot`] can be taken at any time without stopping anything.
//! Counters are monotonic over the service lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct ServiceStatistic {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_relayed: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_failed: AtomicU64,
    messages_relayed: AtomicU64,
    connections_started: AtomicU64,
    connections_stopped: AtomicU64,
    pools_created: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_relayed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub messages_relayed: u64,
    pub connections_started: u64,
    pub connections_stopped: u64,
    pub pools_created: u64,
}

impl ServiceStatistic {
    pub fn snapshot(&self) -> StatisticSnapshot {
        StatisticSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_relayed: self.packets_relayed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            connections_started: self.connections_started.load(Ordering::Relaxed),
            connections_stopped: self.connections_stopped.load(Ordering::Relaxed),
            pools_created: self.pools_created.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_packet_relayed(&self) {
        self.packets_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_connection_started(&self) {
        self.connections_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_connection_stopped(&self) {
        self.connections_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_pool_created(&self) {
        self.pools_created.fetch_add(1, Ordering::Relaxed);
    }
}
