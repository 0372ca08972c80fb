//! # Service
//!
//! The public surface: owns the pool index, the connection registry, the
//! optional listener, and the type registry, and exposes the send / cancel /
//! pool-lifecycle / connection-notify operations. A `Service` is a cheap
//! handle (`Arc` inside); handlers receive an explicit [`ConnectionContext`]
//! value carrying the service, the recipient handle, and the delivered
//! message's request metadata. There are no singletons and no thread-local
//! accessors anywhere.
//!
//! Locking is deliberately coarse and shallow: one mutex around the pool
//! index (taken only to create or evict pools), one around the connection
//! registry, and each pool's own admission lock. Per-connection state is
//! touched only on the connection's task, reached by posted commands.

use crate::config::Configuration;
use crate::connection::{
    run_connection, ConnectionCommand, ConnectionRole, ConnectionSetup, NotifyFn, RawRecvFn,
    StopReport,
};
use crate::error::Error;
use crate::message::{MessageBundle, MessageFlags, MessageId, MessagePtr, RecipientId};
use crate::pool::{Pool, PoolAction};
use crate::protocol::SendCompleteFn;
use crate::relay::RelayConnection;
use crate::statistics::{ServiceStatistic, StatisticSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reported once the service started; carries the actual listen addresses
/// (useful with an ephemeral port).
#[derive(Debug, Clone, Default)]
pub struct ServiceStartStatus {
    pub listen_addrs: Vec<SocketAddr>,
}

/// Pool lifecycle notifications delivered through `on_pool_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Created,
    Closing,
    Removed,
}

/// Where a send is aimed: a recipient URL (pool key) or an existing handle.
pub enum RecipientTarget {
    Url(String),
    Id(RecipientId),
}

impl From<&str> for RecipientTarget {
    fn from(url: &str) -> Self {
        RecipientTarget::Url(url.to_owned())
    }
}

impl From<String> for RecipientTarget {
    fn from(url: String) -> Self {
        RecipientTarget::Url(url)
    }
}

impl From<RecipientId> for RecipientTarget {
    fn from(id: RecipientId) -> Self {
        RecipientTarget::Id(id)
    }
}

impl From<&ConnectionContext> for RecipientTarget {
    fn from(ctx: &ConnectionContext) -> Self {
        RecipientTarget::Id(ctx.recipient_id())
    }
}

struct ConnEntry {
    unique: u32,
    sender: mpsc::UnboundedSender<ConnectionCommand>,
}

#[derive(Default)]
struct ConnRegistry {
    entries: Vec<Option<ConnEntry>>,
    free: Vec<u32>,
    next_unique: u32,
}

impl ConnRegistry {
    fn insert(&mut self, sender: mpsc::UnboundedSender<ConnectionCommand>) -> (u32, u32) {
        self.next_unique = self.next_unique.wrapping_add(1);
        let unique = self.next_unique;
        let entry = ConnEntry { unique, sender };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        (index, unique)
    }

    fn get(&self, index: u32, unique: u32) -> Option<&ConnEntry> {
        self.entries
            .get(index as usize)?
            .as_ref()
            .filter(|e| e.unique == unique)
    }

    fn remove(&mut self, index: u32, unique: u32) -> bool {
        if let Some(slot) = self.entries.get_mut(index as usize) {
            if slot.as_ref().map(|e| e.unique == unique).unwrap_or(false) {
                *slot = None;
                self.free.push(index);
                return true;
            }
        }
        false
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }
}

#[derive(Default)]
struct PoolIndex {
    by_name: HashMap<String, u32>,
    entries: Vec<Option<Arc<Pool>>>,
    free: Vec<u32>,
}

pub(crate) struct ServiceInner {
    pub config: Arc<Configuration>,
    pub statistic: ServiceStatistic,
    pools: Mutex<PoolIndex>,
    conns: Mutex<ConnRegistry>,
    listen_addrs: Mutex<Vec<SocketAddr>>,
    /// Message ids for sends that bypass a pool (responses on server-side
    /// connections).
    next_poolless_msg: AtomicU32,
    stopping: AtomicBool,
}

/// Handle to a running RPC service. Cloning is cheap; all clones refer to
/// the same instance.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Validate the configuration, bind the listener when configured as a
    /// server, and return the running service.
    pub async fn start(config: Configuration) -> Result<Service, Error> {
        config.check()?;
        let config = Arc::new(config);
        let inner = Arc::new(ServiceInner {
            config: config.clone(),
            statistic: ServiceStatistic::default(),
            pools: Mutex::new(PoolIndex::default()),
            conns: Mutex::new(ConnRegistry::default()),
            listen_addrs: Mutex::new(Vec::new()),
            next_poolless_msg: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
        });

        if let Some(server) = &config.server {
            let listener = TcpListener::bind(&server.listener_addr)
                .await
                .map_err(|e| Error::Listen(format!("{}: {}", server.listener_addr, e)))?;
            let local = listener
                .local_addr()
                .map_err(|e| Error::Listen(e.to_string()))?;
            info!(%local, "service listening");
            inner.listen_addrs.lock().push(local);

            let weak = Arc::downgrade(&inner);
            tokio::spawn(accept_loop(listener, weak));
        }

        Ok(Service { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ServiceInner>) -> Service {
        Service { inner }
    }

    pub fn start_status(&self) -> ServiceStartStatus {
        ServiceStartStatus {
            listen_addrs: self.inner.listen_addrs.lock().clone(),
        }
    }

    pub fn statistic(&self) -> StatisticSnapshot {
        self.inner.statistic.snapshot()
    }

    // -- sending ------------------------------------------------------------

    /// Send a one-way (or flag-driven) message to a recipient.
    pub fn send_message<T>(
        &self,
        recipient: impl Into<RecipientTarget>,
        message: T,
        flags: MessageFlags,
    ) -> Result<MessageId, Error>
    where
        T: Send + 'static,
    {
        self.do_send(recipient.into(), Box::new(message), flags, None, None)
    }

    /// Send a request and receive its completion through `on_complete`,
    /// which overrides the registry's complete hook for this message.
    pub fn send_request<T, F>(
        &self,
        recipient: impl Into<RecipientTarget>,
        message: T,
        on_complete: F,
    ) -> Result<MessageId, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut ConnectionContext, Option<T>, Option<T>, Option<&Error>) + Send + 'static,
    {
        let complete: SendCompleteFn = Box::new(move |ctx, sent, recv, err| {
            let sent = sent.and_then(|p| p.downcast::<T>().ok()).map(|b| *b);
            let recv = recv.and_then(|p| p.downcast::<T>().ok()).map(|b| *b);
            on_complete(ctx, sent, recv, err);
        });
        self.do_send(
            recipient.into(),
            Box::new(message),
            MessageFlags::AWAIT_RESPONSE,
            None,
            Some(complete),
        )
    }

    /// Respond to the request currently carried by `ctx`. The response is
    /// pinned to the connection that delivered the request.
    pub fn send_response<T>(&self, ctx: &ConnectionContext, message: T) -> Result<MessageId, Error>
    where
        T: Send + 'static,
    {
        let request_id = ctx
            .request_id()
            .ok_or(Error::BadState("context carries no request"))?;
        self.send_response_to(ctx.recipient_id(), request_id, message)
    }

    /// Respond later, from outside the delivering handler.
    pub fn send_response_to<T>(
        &self,
        recipient_id: RecipientId,
        request_id: u64,
        message: T,
    ) -> Result<MessageId, Error>
    where
        T: Send + 'static,
    {
        self.do_send(
            RecipientTarget::Id(recipient_id),
            Box::new(message),
            MessageFlags::RESPONSE,
            Some(request_id),
            None,
        )
    }

    /// Send a message with an explicit relay path: it travels to the relay
    /// node named by `recipient` and is forwarded to the connection
    /// registered there under `relay_name`.
    pub fn send_relayed_message<T>(
        &self,
        recipient: impl Into<RecipientTarget>,
        relay_name: &str,
        message: T,
        flags: MessageFlags,
    ) -> Result<MessageId, Error>
    where
        T: Send + 'static,
    {
        let mut bundle = self.make_bundle(Box::new(message), flags, None, None)?;
        bundle.relay_name = Some(relay_name.to_owned());
        self.route_bundle(recipient.into(), bundle)
    }

    /// Cancel a message wherever it currently is. Idempotent.
    pub fn cancel_message(
        &self,
        recipient: impl Into<RecipientTarget>,
        msg_id: MessageId,
    ) -> Result<(), Error> {
        match recipient.into() {
            RecipientTarget::Url(url) => {
                let pool = self.existing_pool(&url).ok_or(Error::NoPool)?;
                let actions = pool.cancel_message(msg_id);
                self.execute_pool_actions(&pool, actions);
                Ok(())
            }
            RecipientTarget::Id(rid) if rid.has_pool() => {
                let pool = self.pool_by_index(rid.pool_index).ok_or(Error::NoPool)?;
                let actions = pool.cancel_message(msg_id);
                self.execute_pool_actions(&pool, actions);
                Ok(())
            }
            RecipientTarget::Id(rid) => {
                self.command(rid, ConnectionCommand::CancelMessage { msg_id })
            }
        }
    }

    // -- pool lifecycle -----------------------------------------------------

    /// Pre-create the pool for `url`, maintaining `persistent_count`
    /// connections to it.
    pub fn create_connection_pool(
        &self,
        url: &str,
        persistent_count: usize,
    ) -> Result<(), Error> {
        let pool = self.get_or_create_pool(url, persistent_count)?;
        let actions = pool.ensure_started();
        self.execute_pool_actions(&pool, actions);
        Ok(())
    }

    /// Complete every queued message with `PoolStopping` and stop all the
    /// pool's connections with no grace.
    pub fn force_close_connection_pool(
        &self,
        recipient: impl Into<RecipientTarget>,
    ) -> Result<(), Error> {
        let pool = self.target_pool(recipient.into())?;
        self.pool_event(&pool, PoolEvent::Closing);
        let actions = pool.force_close();
        self.execute_pool_actions(&pool, actions);
        Ok(())
    }

    /// Stop admitting new messages and let in-flight traffic drain; the
    /// pool is destroyed when its last connection stops.
    pub fn delay_close_connection_pool(
        &self,
        recipient: impl Into<RecipientTarget>,
    ) -> Result<(), Error> {
        let pool = self.target_pool(recipient.into())?;
        self.pool_event(&pool, PoolEvent::Closing);
        let actions = pool.delay_close();
        self.execute_pool_actions(&pool, actions);
        Ok(())
    }

    // -- connection notifications --------------------------------------------

    pub fn connection_notify_enter_active_state(
        &self,
        recipient_id: RecipientId,
        done: Option<NotifyFn>,
    ) -> Result<(), Error> {
        self.command(recipient_id, ConnectionCommand::EnterActive { done })
    }

    pub fn connection_notify_enter_passive_state(
        &self,
        recipient_id: RecipientId,
        done: Option<NotifyFn>,
    ) -> Result<(), Error> {
        self.command(recipient_id, ConnectionCommand::EnterPassive { done })
    }

    pub fn connection_notify_start_secure_handshake(
        &self,
        recipient_id: RecipientId,
        done: Option<NotifyFn>,
    ) -> Result<(), Error> {
        self.command(
            recipient_id,
            ConnectionCommand::StartSecureHandshake { done },
        )
    }

    /// Queue raw bytes on a Raw-state connection; `done` fires once they
    /// are fully flushed to the socket.
    pub fn connection_notify_send_all_raw_data(
        &self,
        recipient_id: RecipientId,
        data: Vec<u8>,
        done: NotifyFn,
    ) -> Result<(), Error> {
        self.command(recipient_id, ConnectionCommand::SendRawData { data, done })
    }

    /// Receive whatever raw bytes arrive next on a Raw-state connection.
    pub fn connection_notify_recv_some_raw_data(
        &self,
        recipient_id: RecipientId,
        done: RawRecvFn,
    ) -> Result<(), Error> {
        self.command(recipient_id, ConnectionCommand::RecvRawData { done })
    }

    /// Run `f` on the connection's own task.
    pub fn connection_post<F>(&self, recipient_id: RecipientId, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut ConnectionContext) + Send + 'static,
    {
        self.command(recipient_id, ConnectionCommand::Post(Box::new(f)))
    }

    /// Run `f` on every live connection's task.
    pub fn connection_post_all<F>(&self, f: F)
    where
        F: Fn(&mut ConnectionContext) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let conns = self.inner.conns.lock();
        for entry in conns.entries.iter().flatten() {
            let f = f.clone();
            let _ = entry
                .sender
                .send(ConnectionCommand::Post(Box::new(move |ctx| f(ctx))));
        }
    }

    /// Register the connection under `name` with the relay engine, making
    /// it addressable as a relay destination.
    pub fn register_relay_name(&self, recipient_id: RecipientId, name: &str) -> Result<(), Error> {
        let engine = self
            .inner
            .config
            .relay
            .clone()
            .ok_or(Error::NotConfigured("relay engine"))?;
        let sender = {
            let conns = self.inner.conns.lock();
            conns
                .get(recipient_id.connection_index, recipient_id.unique)
                .map(|e| e.sender.clone())
                .ok_or(Error::NoConnection)?
        };
        if engine.register_connection_name(
            name,
            RelayConnection {
                uid: recipient_id,
                sender,
            },
        ) {
            Ok(())
        } else {
            Err(Error::BadState("relay name already registered"))
        }
    }

    /// Stop the whole service: close every pool with no grace and stop all
    /// connections, then wait briefly for the tasks to unwind.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<Pool>> = {
            let index = self.inner.pools.lock();
            index.entries.iter().flatten().cloned().collect()
        };
        for pool in pools {
            self.pool_event(&pool, PoolEvent::Closing);
            let actions = pool.force_close();
            self.execute_pool_actions(&pool, actions);
        }
        {
            let conns = self.inner.conns.lock();
            for entry in conns.entries.iter().flatten() {
                let _ = entry.sender.send(ConnectionCommand::Stop { force: true });
            }
        }
        for _ in 0..500 {
            if self.inner.conns.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        debug!("service stopped");
    }

    // -- internals ----------------------------------------------------------

    fn make_bundle(
        &self,
        message: MessagePtr,
        flags: MessageFlags,
        response_request_id: Option<u64>,
        complete_fnc: Option<SendCompleteFn>,
    ) -> Result<MessageBundle, Error> {
        let type_id = self
            .inner
            .config
            .protocol
            .type_id_of(&message)
            .ok_or(Error::BadState("message type not registered"))?;
        Ok(MessageBundle {
            message,
            type_id,
            flags,
            relay_name: None,
            response_request_id,
            complete_fnc,
        })
    }

    fn do_send(
        &self,
        target: RecipientTarget,
        message: MessagePtr,
        flags: MessageFlags,
        response_request_id: Option<u64>,
        complete_fnc: Option<SendCompleteFn>,
    ) -> Result<MessageId, Error> {
        let bundle = self.make_bundle(message, flags, response_request_id, complete_fnc)?;
        self.route_bundle(target, bundle)
    }

    fn route_bundle(
        &self,
        target: RecipientTarget,
        bundle: MessageBundle,
    ) -> Result<MessageId, Error> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(Error::PoolStopping);
        }
        match target {
            RecipientTarget::Url(url) => {
                let pool = self.get_or_create_pool(&url, 0)?;
                let (result, actions) = pool.send_message(bundle);
                self.execute_pool_actions(&pool, actions);
                result
            }
            // A response always rides the connection that delivered its
            // request, never the pool's admission policy.
            RecipientTarget::Id(rid)
                if rid.has_pool() && !bundle.flags.has(MessageFlags::RESPONSE) =>
            {
                let pool = self.pool_by_index(rid.pool_index).ok_or(Error::NoPool)?;
                let (result, actions) = pool.send_message(bundle);
                self.execute_pool_actions(&pool, actions);
                result
            }
            RecipientTarget::Id(rid) => {
                // Direct push to one connection; the id allocator is
                // service-global.
                let unique = self.inner.next_poolless_msg.fetch_add(1, Ordering::Relaxed);
                let msg_id = MessageId {
                    index: u32::MAX,
                    unique,
                };
                self.command(rid, ConnectionCommand::PushMessage { msg_id, bundle })?;
                Ok(msg_id)
            }
        }
    }

    fn command(&self, rid: RecipientId, cmd: ConnectionCommand) -> Result<(), Error> {
        let conns = self.inner.conns.lock();
        let entry = conns
            .get(rid.connection_index, rid.unique)
            .ok_or(Error::NoConnection)?;
        entry.sender.send(cmd).map_err(|_| Error::NoConnection)
    }

    fn target_pool(&self, target: RecipientTarget) -> Result<Arc<Pool>, Error> {
        match target {
            RecipientTarget::Url(url) => self.existing_pool(&url).ok_or(Error::NoPool),
            RecipientTarget::Id(rid) if rid.has_pool() => {
                self.pool_by_index(rid.pool_index).ok_or(Error::NoPool)
            }
            RecipientTarget::Id(_) => Err(Error::NoPool),
        }
    }

    fn existing_pool(&self, url: &str) -> Option<Arc<Pool>> {
        let name = self.inner.config.recipient_name(url);
        let index = self.inner.pools.lock();
        let idx = *index.by_name.get(&name)?;
        index.entries.get(idx as usize)?.clone()
    }

    fn pool_by_index(&self, pool_index: u32) -> Option<Arc<Pool>> {
        let index = self.inner.pools.lock();
        index.entries.get(pool_index as usize)?.clone()
    }

    fn get_or_create_pool(&self, url: &str, persistent: usize) -> Result<Arc<Pool>, Error> {
        if self.inner.config.client.is_none() {
            return Err(Error::NotConfigured("client side"));
        }
        let name = self.inner.config.recipient_name(url);
        let mut index = self.inner.pools.lock();
        if let Some(&idx) = index.by_name.get(&name) {
            if let Some(pool) = index.entries.get(idx as usize).and_then(|p| p.clone()) {
                return Ok(pool);
            }
        }
        let idx = match index.free.pop() {
            Some(idx) => idx,
            None => {
                index.entries.push(None);
                (index.entries.len() - 1) as u32
            }
        };
        let pool = Arc::new(Pool::new(
            idx,
            name.clone(),
            self.inner.config.clone(),
            persistent,
        ));
        index.entries[idx as usize] = Some(pool.clone());
        index.by_name.insert(name, idx);
        drop(index);
        self.inner.statistic.note_pool_created();
        self.pool_event(&pool, PoolEvent::Created);
        Ok(pool)
    }

    fn pool_event(&self, pool: &Pool, event: PoolEvent) {
        if let Some(hook) = &self.inner.config.on_pool_event {
            hook(&pool.name, event);
        }
    }

    fn execute_pool_actions(&self, pool: &Arc<Pool>, actions: Vec<PoolAction>) {
        for action in actions {
            match action {
                PoolAction::SpawnConnection { addr } => {
                    self.spawn_client_connection(pool, addr);
                }
                PoolAction::StartResolve => {
                    let service = self.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        let resolver = service
                            .inner
                            .config
                            .client
                            .as_ref()
                            .map(|c| c.resolver.clone());
                        let result = match resolver {
                            Some(resolver) => resolver.resolve(&pool.name).await,
                            None => Err(Error::NotConfigured("client side")),
                        };
                        let actions = pool.on_resolved(result);
                        service.execute_pool_actions(&pool, actions);
                    });
                }
                PoolAction::ScheduleReconnect { delay } => {
                    let service = self.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let actions = pool.reconnect_tick();
                        service.execute_pool_actions(&pool, actions);
                    });
                }
                PoolAction::RemovePool => {
                    let mut index = self.inner.pools.lock();
                    if let Some(slot) = index.entries.get_mut(pool.index as usize) {
                        *slot = None;
                        index.free.push(pool.index);
                    }
                    index.by_name.remove(&pool.name);
                    drop(index);
                    self.pool_event(pool, PoolEvent::Removed);
                }
                PoolAction::FailMessages(failed) => {
                    for (msg_id, bundle, err) in failed {
                        self.complete_failed_bundle(msg_id, bundle, err);
                    }
                }
            }
        }
    }

    /// Complete a message that never reached a connection.
    fn complete_failed_bundle(&self, _msg_id: MessageId, bundle: MessageBundle, err: Error) {
        self.inner.statistic.note_message_failed();
        let (dummy_tx, _dummy_rx) = mpsc::unbounded_channel();
        let mut ctx = ConnectionContext::new(
            self.clone(),
            RecipientId::INVALID,
            None,
            dummy_tx,
        );
        if let Some(f) = bundle.complete_fnc {
            f(&mut ctx, Some(bundle.message), None, Some(&err));
        } else if let Some(hook) = self.inner.config.protocol.complete_hook(bundle.type_id) {
            hook(&mut ctx, Some(bundle.message), None, Some(&err));
        }
    }

    fn spawn_client_connection(&self, pool: &Arc<Pool>, addr: SocketAddr) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let load = Arc::new(AtomicUsize::new(0));
        let (conn_index, unique) = self.inner.conns.lock().insert(cmd_tx.clone());
        pool.register_connection(conn_index, unique, cmd_tx.clone(), load.clone());
        self.inner.statistic.note_connection_started();

        let uid = RecipientId {
            pool_index: pool.index,
            connection_index: conn_index,
            unique,
        };
        let setup = ConnectionSetup {
            service: Arc::downgrade(&self.inner),
            config: self.inner.config.clone(),
            uid,
            pool_name: Some(pool.name.clone()),
            cmd_rx,
            cmd_tx,
            load,
            role: ConnectionRole::Client {
                addr,
                server_name: pool.name.clone(),
            },
        };
        tokio::spawn(run_connection(setup));
    }
}

impl ServiceInner {
    /// Called from a connection task once it reaches Active.
    pub(crate) fn on_connection_active(self: &Arc<Self>, uid: RecipientId, pool_name: Option<&str>) {
        let _ = pool_name;
        if !uid.has_pool() {
            return;
        }
        let pool = {
            let index = self.pools.lock();
            index
                .entries
                .get(uid.pool_index as usize)
                .and_then(|p| p.clone())
        };
        if let Some(pool) = pool {
            let actions = pool.on_connection_active(uid.connection_index, uid.unique);
            Service::from_inner(self.clone()).execute_pool_actions(&pool, actions);
        }
    }

    /// Called from a connection task as it unwinds.
    pub(crate) fn on_connection_stopped(
        self: &Arc<Self>,
        uid: RecipientId,
        pool_name: Option<&str>,
        report: StopReport,
    ) {
        let _ = pool_name;
        self.statistic.note_connection_stopped();
        self.conns.lock().remove(uid.connection_index, uid.unique);
        if !uid.has_pool() {
            return;
        }
        let pool = {
            let index = self.pools.lock();
            index
                .entries
                .get(uid.pool_index as usize)
                .and_then(|p| p.clone())
        };
        if let Some(pool) = pool {
            let actions = pool.on_connection_stopped(uid.connection_index, uid.unique, report);
            Service::from_inner(self.clone()).execute_pool_actions(&pool, actions);
        }
    }
}

/// Accept loop: one spawned task per listener, one task per accepted
/// connection.
async fn accept_loop(listener: TcpListener, service: Weak<ServiceInner>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        };
        let Some(inner) = service.upgrade() else {
            break;
        };
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        debug!(%peer_addr, "accepted connection");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let load = Arc::new(AtomicUsize::new(0));
        let (conn_index, unique) = inner.conns.lock().insert(cmd_tx.clone());
        inner.statistic.note_connection_started();

        let uid = RecipientId {
            pool_index: RecipientId::NO_POOL,
            connection_index: conn_index,
            unique,
        };
        let setup = ConnectionSetup {
            service: Arc::downgrade(&inner),
            config: inner.config.clone(),
            uid,
            pool_name: None,
            cmd_rx,
            cmd_tx,
            load,
            role: ConnectionRole::Server { stream, peer_addr },
        };
        tokio::spawn(run_connection(setup));
    }
    warn!("listener stopped");
}

// ---------------------------------------------------------------------------
// ConnectionContext
// ---------------------------------------------------------------------------

/// Explicit per-invocation context handed to every hook and handler: the
/// service, the recipient handle, the peer address, and, for delivered
/// messages, the request id and flags needed to respond.
pub struct ConnectionContext {
    service: Service,
    recipient_id: RecipientId,
    peer_addr: Option<SocketAddr>,
    request_id: Option<u64>,
    request_flags: MessageFlags,
    conn_sender: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionContext {
    pub(crate) fn new(
        service: Service,
        recipient_id: RecipientId,
        peer_addr: Option<SocketAddr>,
        conn_sender: mpsc::UnboundedSender<ConnectionCommand>,
    ) -> Self {
        ConnectionContext {
            service,
            recipient_id,
            peer_addr,
            request_id: None,
            request_flags: MessageFlags::empty(),
            conn_sender,
        }
    }

    pub(crate) fn set_request(&mut self, request_id: u64, flags: MessageFlags) {
        self.request_id = Some(request_id);
        self.request_flags = flags;
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn recipient_id(&self) -> RecipientId {
        self.recipient_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Request id of the message being delivered, if any.
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    /// Flags of the message being delivered.
    pub fn request_flags(&self) -> MessageFlags {
        self.request_flags
    }

    /// Whether the delivered message awaits a response from us.
    pub fn awaits_response(&self) -> bool {
        self.request_flags.awaits_response()
    }

    /// Register this connection as a relay destination under `name`.
    pub fn register_relay_name(&self, name: &str) -> Result<(), Error> {
        let engine = self
            .service
            .inner
            .config
            .relay
            .clone()
            .ok_or(Error::NotConfigured("relay engine"))?;
        if engine.register_connection_name(
            name,
            RelayConnection {
                uid: self.recipient_id,
                sender: self.conn_sender.clone(),
            },
        ) {
            Ok(())
        } else {
            Err(Error::BadState("relay name already registered"))
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("recipient_id", &self.recipient_id)
            .field("peer_addr", &self.peer_addr)
            .field("request_id", &self.request_id)
            .finish()
    }
}
