//! # Connection Pool
//!
//! Per-recipient container of connections plus the admission queue. The pool
//! owns the one lock senders from arbitrary threads contend on; everything
//! slow (spawning connections, resolving names, backoff timers) happens
//! outside it. Methods mutate under the lock and hand back a list of
//! [`PoolAction`]s for the service to execute afterwards, so no I/O or user
//! callback ever runs with the lock held.
//!
//! Admission policy, in order: responses are pinned to their originating
//! connection (they bypass the pool entirely); synchronous messages ride the
//! pool's designated synchronous connection; everything else goes to the
//! least-loaded Active connection, triggers a new connection under the caps,
//! or waits in the bounded pending queue.

use crate::config::Configuration;
use crate::connection::{ConnectionCommand, StopReport};
use crate::error::Error;
use crate::message::{MessageBundle, MessageId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Deferred work decided under the pool lock, executed by the service.
pub(crate) enum PoolAction {
    /// Spawn a client connection to `addr`.
    SpawnConnection { addr: SocketAddr },
    /// Kick off asynchronous name resolution for this pool.
    StartResolve,
    /// Re-attempt connection creation after `delay`.
    ScheduleReconnect { delay: Duration },
    /// The pool has fully drained; the service should drop it.
    RemovePool,
    /// Complete these messages with the error, outside the lock.
    FailMessages(Vec<(MessageId, MessageBundle, Error)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    DelayClose,
    ForceClose,
}

struct Slot {
    conn_index: u32,
    unique: u32,
    sender: UnboundedSender<ConnectionCommand>,
    load: Arc<AtomicUsize>,
    active: bool,
}

struct QueuedMessage {
    msg_id: MessageId,
    bundle: MessageBundle,
}

struct PoolState {
    slots: Vec<Slot>,
    msg_queue: VecDeque<QueuedMessage>,
    next_msg_index: u32,
    next_msg_unique: u32,
    /// Spawns decided but not yet registered, counted against the caps.
    spawning: usize,
    close: CloseState,
    sync_conn: Option<(u32, u32)>,
    persistent_count: usize,
    resolved: Vec<SocketAddr>,
    next_addr: usize,
    resolve_in_flight: bool,
    resolve_retry: u32,
    retry_count: u32,
    reconnect_scheduled: bool,
    last_report: Option<StopReport>,
}

impl PoolState {
    fn alloc_msg_id(&mut self) -> MessageId {
        let id = MessageId {
            index: self.next_msg_index,
            unique: self.next_msg_unique,
        };
        self.next_msg_index = self.next_msg_index.wrapping_add(1);
        if self.next_msg_index == 0 {
            self.next_msg_unique = self.next_msg_unique.wrapping_add(1);
        }
        id
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    fn pending_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.active).count() + self.spawning
    }

    fn least_loaded_active(&self) -> Option<&Slot> {
        self.slots
            .iter()
            .filter(|s| s.active)
            .min_by_key(|s| s.load.load(Ordering::Relaxed))
    }

    fn slot_by_conn(&self, conn_index: u32, unique: u32) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|s| s.conn_index == conn_index && s.unique == unique)
    }
}

/// One per recipient name; owned by the service's pool index.
pub(crate) struct Pool {
    pub index: u32,
    pub name: String,
    config: Arc<Configuration>,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(index: u32, name: String, config: Arc<Configuration>, persistent: usize) -> Self {
        Pool {
            index,
            name,
            config,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                msg_queue: VecDeque::new(),
                next_msg_index: 0,
                next_msg_unique: 1,
                spawning: 0,
                close: CloseState::Open,
                sync_conn: None,
                persistent_count: persistent,
                resolved: Vec::new(),
                next_addr: 0,
                resolve_in_flight: false,
                resolve_retry: 0,
                retry_count: 0,
                reconnect_scheduled: false,
                last_report: None,
            }),
        }
    }

    /// Admit one message; returns its id or the synchronous admission error.
    pub fn send_message(
        &self,
        bundle: MessageBundle,
    ) -> (Result<MessageId, Error>, Vec<PoolAction>) {
        let mut actions = Vec::new();
        let mut st = self.state.lock();

        if st.close != CloseState::Open {
            return (Err(Error::PoolStopping), actions);
        }

        let msg_id = st.alloc_msg_id();
        let is_sync = bundle.flags.is_synchronous();

        if is_sync {
            if let Some((ci, cu)) = st.sync_conn {
                let target = st
                    .slot_by_conn(ci, cu)
                    .filter(|s| s.active)
                    .map(|s| s.sender.clone());
                match target {
                    Some(sender) => {
                        match sender.send(ConnectionCommand::PushMessage { msg_id, bundle }) {
                            Ok(()) => return (Ok(msg_id), actions),
                            Err(e) => {
                                st.sync_conn = None;
                                let ConnectionCommand::PushMessage { bundle, .. } = e.0 else {
                                    unreachable!(
                                        "send returns the command it failed to deliver"
                                    );
                                };
                                return self.queue_message(&mut st, msg_id, bundle, &mut actions);
                            }
                        }
                    }
                    None => st.sync_conn = None,
                }
            }
            // No designated synchronous connection yet: queue and make sure
            // one comes up.
            return self.queue_message(&mut st, msg_id, bundle, &mut actions);
        }

        if let Some((conn, sender)) = st
            .least_loaded_active()
            .map(|s| (s.conn_index, s.sender.clone()))
        {
            match sender.send(ConnectionCommand::PushMessage { msg_id, bundle }) {
                Ok(()) => {
                    trace!(pool = %self.name, conn, "message admitted");
                    return (Ok(msg_id), actions);
                }
                Err(e) => {
                    // The slot is dying; queue instead, the stop event will
                    // route the message onto the next connection.
                    let ConnectionCommand::PushMessage { bundle, .. } = e.0 else {
                        unreachable!("send returns the command it failed to deliver");
                    };
                    return self.queue_message(&mut st, msg_id, bundle, &mut actions);
                }
            }
        }

        self.queue_message(&mut st, msg_id, bundle, &mut actions)
    }

    fn queue_message(
        &self,
        st: &mut PoolState,
        msg_id: MessageId,
        bundle: MessageBundle,
        actions: &mut Vec<PoolAction>,
    ) -> (Result<MessageId, Error>, Vec<PoolAction>) {
        if st.msg_queue.len() >= self.config.pool_max_message_queue_size {
            return (Err(Error::QueueFull), std::mem::take(actions));
        }
        st.msg_queue.push_back(QueuedMessage { msg_id, bundle });
        self.ensure_connection(st, actions);
        (Ok(msg_id), std::mem::take(actions))
    }

    /// Make sure a connection is coming up if the caps allow one.
    fn ensure_connection(&self, st: &mut PoolState, actions: &mut Vec<PoolAction>) {
        if st.close != CloseState::Open && st.msg_queue.is_empty() {
            return;
        }
        if st.active_count() >= self.config.pool_max_active_connection_count {
            return;
        }
        if st.pending_count() >= self.config.pool_max_pending_connection_count {
            return;
        }
        if st.resolved.is_empty() {
            if !st.resolve_in_flight {
                st.resolve_in_flight = true;
                actions.push(PoolAction::StartResolve);
            }
            return;
        }
        let addr = st.resolved[st.next_addr % st.resolved.len()];
        st.next_addr += 1;
        st.spawning += 1;
        debug!(pool = %self.name, %addr, "spawning connection");
        actions.push(PoolAction::SpawnConnection { addr });
    }

    /// Record a freshly spawned connection in a pending slot.
    pub fn register_connection(
        &self,
        conn_index: u32,
        unique: u32,
        sender: UnboundedSender<ConnectionCommand>,
        load: Arc<AtomicUsize>,
    ) {
        let mut st = self.state.lock();
        st.spawning = st.spawning.saturating_sub(1);
        st.slots.push(Slot {
            conn_index,
            unique,
            sender,
            load,
            active: false,
        });
    }

    /// A connection reached Active: flush what it can take.
    pub fn on_connection_active(&self, conn_index: u32, unique: u32) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        if let Some(slot) = st
            .slots
            .iter_mut()
            .find(|s| s.conn_index == conn_index && s.unique == unique)
        {
            slot.active = true;
        }
        st.retry_count = 0;
        st.resolve_retry = 0;
        self.flush_queue(&mut st, &mut actions);
        actions
    }

    /// A connection stopped; decide requeue/reconnect/removal.
    pub fn on_connection_stopped(
        &self,
        conn_index: u32,
        unique: u32,
        report: StopReport,
    ) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();

        st.slots
            .retain(|s| !(s.conn_index == conn_index && s.unique == unique));
        if st.sync_conn == Some((conn_index, unique)) {
            st.sync_conn = None;
        }

        match st.close {
            CloseState::Open => {
                if report.error.is_some() || !report.was_connected {
                    st.retry_count = st.retry_count.saturating_add(1);
                }
                st.last_report = Some(report);
                let needed = st.persistent_count > st.slots.len() || !st.msg_queue.is_empty();
                if needed && !st.reconnect_scheduled {
                    let r = st.last_report.as_ref().expect("just stored");
                    let delay = self.config.reconnect_delay(
                        st.retry_count,
                        r.was_connected,
                        r.was_active,
                        r.was_secured,
                    );
                    st.reconnect_scheduled = true;
                    actions.push(PoolAction::ScheduleReconnect { delay });
                }
            }
            CloseState::DelayClose | CloseState::ForceClose => {
                if st.slots.is_empty() && st.spawning == 0 {
                    actions.push(PoolAction::RemovePool);
                }
            }
        }
        actions
    }

    /// Reconnect timer fired.
    pub fn reconnect_tick(&self) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        st.reconnect_scheduled = false;
        if st.close == CloseState::Open
            && (st.persistent_count > st.slots.len() || !st.msg_queue.is_empty())
        {
            self.ensure_connection(&mut st, &mut actions);
        }
        actions
    }

    /// Name resolution finished.
    pub fn on_resolved(&self, result: Result<Vec<SocketAddr>, Error>) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        st.resolve_in_flight = false;
        match result {
            Ok(addrs) => {
                debug!(pool = %self.name, count = addrs.len(), "resolved");
                st.resolved = addrs;
                st.next_addr = 0;
                st.resolve_retry = 0;
                self.ensure_connection(&mut st, &mut actions);
            }
            Err(err) => {
                let retry_cap = self
                    .config
                    .client
                    .as_ref()
                    .map(|c| c.resolve_retry_count)
                    .unwrap_or(0);
                st.resolve_retry += 1;
                if st.resolve_retry <= retry_cap {
                    debug!(pool = %self.name, retry = st.resolve_retry, %err, "resolve retry");
                    if !st.reconnect_scheduled {
                        st.reconnect_scheduled = true;
                        let delay = self.config.reconnect_delay(st.resolve_retry, false, false, false);
                        actions.push(PoolAction::ScheduleReconnect { delay });
                    }
                } else {
                    // Resolution exhausted: everything waiting fails.
                    let failed = st
                        .msg_queue
                        .drain(..)
                        .map(|q| (q.msg_id, q.bundle, err.clone()))
                        .collect::<Vec<_>>();
                    if !failed.is_empty() {
                        actions.push(PoolAction::FailMessages(failed));
                    }
                }
            }
        }
        actions
    }

    /// Cancel a message: pull it from the queue, or tell the connections.
    /// Cancellation is idempotent end to end.
    pub fn cancel_message(&self, msg_id: MessageId) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        if let Some(pos) = st.msg_queue.iter().position(|q| q.msg_id == msg_id) {
            let q = st.msg_queue.remove(pos).expect("position just found");
            actions.push(PoolAction::FailMessages(vec![(
                q.msg_id,
                q.bundle,
                Error::Canceled,
            )]));
            return actions;
        }
        for slot in &st.slots {
            let _ = slot.sender.send(ConnectionCommand::CancelMessage { msg_id });
        }
        actions
    }

    /// Complete every queued message with `PoolStopping` and drop all
    /// connections with no grace.
    pub fn force_close(&self) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        st.close = CloseState::ForceClose;
        let failed = st
            .msg_queue
            .drain(..)
            .map(|q| (q.msg_id, q.bundle, Error::PoolStopping))
            .collect::<Vec<_>>();
        if !failed.is_empty() {
            actions.push(PoolAction::FailMessages(failed));
        }
        for slot in &st.slots {
            let _ = slot.sender.send(ConnectionCommand::Stop { force: true });
        }
        if st.slots.is_empty() && st.spawning == 0 {
            actions.push(PoolAction::RemovePool);
        }
        actions
    }

    /// Stop admitting, let in-flight drain, remove the pool when the last
    /// connection stops.
    pub fn delay_close(&self) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        st.close = CloseState::DelayClose;
        self.maybe_drain_stop(&mut st, &mut actions);
        actions
    }

    /// Bring up the persistent connections of an explicitly created pool.
    pub fn ensure_started(&self) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut st = self.state.lock();
        for _ in st.slots.len() + st.spawning..st.persistent_count {
            self.ensure_connection(&mut st, &mut actions);
        }
        // A pool with no persistent connections still resolves eagerly so
        // the first send does not pay the resolution latency.
        if st.persistent_count == 0 && st.resolved.is_empty() && !st.resolve_in_flight {
            st.resolve_in_flight = true;
            actions.push(PoolAction::StartResolve);
        }
        actions
    }

    fn maybe_drain_stop(&self, st: &mut PoolState, actions: &mut Vec<PoolAction>) {
        if st.close == CloseState::DelayClose && st.msg_queue.is_empty() {
            for slot in &st.slots {
                let _ = slot.sender.send(ConnectionCommand::Stop { force: false });
            }
            if st.slots.is_empty() && st.spawning == 0 {
                actions.push(PoolAction::RemovePool);
            }
        }
    }

    fn flush_queue(&self, st: &mut PoolState, actions: &mut Vec<PoolAction>) {
        loop {
            let Some(front) = st.msg_queue.front() else { break };
            let is_sync = front.bundle.flags.is_synchronous();

            let target = if is_sync {
                let current = st.sync_conn.and_then(|(ci, cu)| {
                    st.slot_by_conn(ci, cu)
                        .filter(|s| s.active)
                        .map(|s| (s.conn_index, s.unique))
                });
                match current {
                    Some(t) => Some(t),
                    None => {
                        // Designate the least-loaded active connection as
                        // the synchronous lane.
                        let designated =
                            st.least_loaded_active().map(|s| (s.conn_index, s.unique));
                        st.sync_conn = designated;
                        designated
                    }
                }
            } else {
                st.least_loaded_active().map(|s| (s.conn_index, s.unique))
            };

            let Some((ci, cu)) = target else {
                self.ensure_connection(st, actions);
                break;
            };
            let Some(slot) = st.slot_by_conn(ci, cu) else { break };
            let sender = slot.sender.clone();
            let q = st.msg_queue.pop_front().expect("front just checked");
            if let Err(e) = sender.send(ConnectionCommand::PushMessage {
                msg_id: q.msg_id,
                bundle: q.bundle,
            }) {
                // Channel closed under us; keep the message queued, the
                // stop event will route it onto the next connection.
                let ConnectionCommand::PushMessage { msg_id, bundle } = e.0 else {
                    unreachable!("send returns the command it failed to deliver");
                };
                st.msg_queue.push_front(QueuedMessage { msg_id, bundle });
                break;
            }
        }
        self.maybe_drain_stop(st, actions);
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.state.lock().msg_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageFlags;
    use crate::protocol::Protocol;
    use crate::resolver::StaticResolver;
    use tokio::sync::mpsc;

    fn config() -> Arc<Configuration> {
        let proto = Arc::new(Protocol::new(1, 0));
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut cfg = Configuration::new(proto)
            .with_resolver(Arc::new(StaticResolver::single(addr)));
        cfg.pool_max_message_queue_size = 4;
        Arc::new(cfg)
    }

    fn bundle(flags: MessageFlags) -> MessageBundle {
        MessageBundle {
            message: Box::new(()),
            type_id: 1,
            flags,
            relay_name: None,
            response_request_id: None,
            complete_fnc: None,
        }
    }

    fn register(
        pool: &Pool,
        conn_index: u32,
    ) -> mpsc::UnboundedReceiver<ConnectionCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        pool.register_connection(conn_index, 1, tx, Arc::new(AtomicUsize::new(0)));
        rx
    }

    #[test]
    fn first_send_queues_and_requests_resolve() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let (result, actions) = pool.send_message(bundle(MessageFlags::empty()));
        assert!(result.is_ok());
        assert_eq!(pool.queue_len(), 1);
        assert!(actions
            .iter()
            .any(|a| matches!(a, PoolAction::StartResolve)));
    }

    #[test]
    fn resolution_triggers_spawn_then_activation_flushes() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let (_, _) = pool.send_message(bundle(MessageFlags::empty()));

        let actions = pool.on_resolved(Ok(vec!["127.0.0.1:9".parse().unwrap()]));
        assert!(actions
            .iter()
            .any(|a| matches!(a, PoolAction::SpawnConnection { .. })));

        let mut rx = register(&pool, 7);
        assert!(pool.on_connection_active(7, 1).is_empty());
        match rx.try_recv().unwrap() {
            ConnectionCommand::PushMessage { .. } => {}
            other => panic!("expected PushMessage, got {:?}", other),
        }
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn active_connection_takes_messages_directly() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let mut rx = register(&pool, 7);
        pool.on_connection_active(7, 1);

        let (result, actions) = pool.send_message(bundle(MessageFlags::empty()));
        assert!(result.is_ok());
        assert!(actions.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConnectionCommand::PushMessage { .. }
        ));
    }

    #[test]
    fn synchronous_messages_ride_one_designated_connection() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let mut rx_a = register(&pool, 1);
        let mut rx_b = register(&pool, 2);

        // Queue two sync messages, then bring both connections up; the
        // flush must designate one synchronous lane and keep to it.
        pool.send_message(bundle(MessageFlags::SYNCHRONOUS));
        pool.send_message(bundle(MessageFlags::SYNCHRONOUS));
        pool.on_connection_active(1, 1);
        pool.on_connection_active(2, 1);

        let a_count = std::iter::from_fn(|| rx_a.try_recv().ok()).count();
        let b_count = std::iter::from_fn(|| rx_b.try_recv().ok()).count();
        assert!(
            (a_count == 2 && b_count == 0) || (a_count == 0 && b_count == 2),
            "sync messages split across connections: {} / {}",
            a_count,
            b_count
        );
    }

    #[test]
    fn queue_bound_is_enforced() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        for _ in 0..4 {
            let (result, _) = pool.send_message(bundle(MessageFlags::empty()));
            assert!(result.is_ok());
        }
        let (result, _) = pool.send_message(bundle(MessageFlags::empty()));
        assert!(matches!(result, Err(Error::QueueFull)));
    }

    #[test]
    fn force_close_fails_queue_and_stops_connections() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let mut rx = register(&pool, 7);
        pool.send_message(bundle(MessageFlags::empty()));

        let actions = pool.force_close();
        let failed = actions.iter().any(|a| {
            matches!(a, PoolAction::FailMessages(msgs)
                if matches!(msgs[0].2, Error::PoolStopping))
        });
        assert!(failed);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConnectionCommand::Stop { force: true }
        ));

        // Admission is closed from now on.
        let (result, _) = pool.send_message(bundle(MessageFlags::empty()));
        assert!(matches!(result, Err(Error::PoolStopping)));
    }

    #[test]
    fn stop_of_last_connection_removes_closing_pool() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let _rx = register(&pool, 7);
        pool.on_connection_active(7, 1);
        pool.delay_close();

        let report = StopReport {
            error: None,
            was_connected: true,
            was_active: true,
            was_secured: false,
        };
        let actions = pool.on_connection_stopped(7, 1, report);
        assert!(actions.iter().any(|a| matches!(a, PoolAction::RemovePool)));
    }

    #[test]
    fn failed_connection_schedules_backoff() {
        let pool = Pool::new(0, "alpha".into(), config(), 1);
        let _rx = register(&pool, 7);

        let report = StopReport {
            error: Some(Error::ConnectRefused("refused".into())),
            was_connected: false,
            was_active: false,
            was_secured: false,
        };
        let actions = pool.on_connection_stopped(7, 1, report);
        assert!(actions
            .iter()
            .any(|a| matches!(a, PoolAction::ScheduleReconnect { .. })));
    }

    #[test]
    fn cancel_pulls_from_queue() {
        let pool = Pool::new(0, "alpha".into(), config(), 0);
        let (result, _) = pool.send_message(bundle(MessageFlags::empty()));
        let msg_id = result.unwrap();

        let actions = pool.cancel_message(msg_id);
        assert!(actions.iter().any(|a| {
            matches!(a, PoolAction::FailMessages(msgs)
                if msgs[0].0 == msg_id && matches!(msgs[0].2, Error::Canceled))
        }));
        assert_eq!(pool.queue_len(), 0);
    }
}
