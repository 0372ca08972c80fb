//! # Connection
//!
//! One tokio task per socket: the task is the actor, commands posted to its
//! channel are the events, and every handler runs on this task, so there is
//! never more than one outstanding read and one outstanding write, and
//! per-connection state needs no lock.
//!
//! Lifecycle: `Connecting → SecureHandshaking? → (Connect/Accept exchange) →
//! Raw → {Passive | Active} → Stopping → Stopped`. The Raw state exchanges
//! opaque bytes for protocol upgrades or auth before the packet machinery is
//! engaged; Passive engages it drain-only; Active admits new messages from
//! the pool.
//!
//! Three timers share one deadline: keepalive (idle-outgoing), the
//! inactivity window (idle-incoming, with the server-side rule that a peer
//! sustaining too many consecutive windows on keep-alives alone is failed),
//! and activation (a connection configured to activate must reach Active in
//! time). Stopping adds a bounded drain grace.

use crate::config::{Configuration, ConnectionEvent, ConnectionState as ConfigConnectionState};
use crate::error::Error;
use crate::message::{MessageBundle, MessageFlags, MessageId, MessagePtr, RecipientId};
use crate::packet::{
    AcceptData, ConnectData, Packet, PacketCodec, PacketType, ReadOutcome, PACKET_CAPACITY,
};
use crate::protocol::{Protocol, SendCompleteFn};
use crate::reader::{MessageReader, ReadEvent};
use crate::relay::{reframe_continue, reframe_start, RelayFrame, RelaySessionId};
use crate::secure::StreamBox;
use crate::service::{ConnectionContext, ServiceInner};
use crate::writer::{MessageWriter, WriteCompletion};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on the connect syscall plus the Connect/Accept exchange.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);
/// Drain grace once a graceful stop begins.
const STOPPING_GRACE: Duration = Duration::from_secs(30);

/// Completion for notify-style commands.
pub type NotifyFn = Box<dyn FnOnce(&mut ConnectionContext, Option<&Error>) + Send>;
/// Completion for a raw receive: the bytes read, or the failure.
pub type RawRecvFn = Box<dyn FnOnce(&mut ConnectionContext, Result<&[u8], &Error>) + Send>;
/// A closure posted onto the connection's actor.
pub(crate) type PostFn = Box<dyn FnOnce(&mut ConnectionContext) + Send>;

/// Events posted to a connection actor. Delivered in order per poster.
pub(crate) enum ConnectionCommand {
    PushMessage {
        msg_id: MessageId,
        bundle: MessageBundle,
    },
    CancelMessage {
        msg_id: MessageId,
    },
    EnterActive {
        done: Option<NotifyFn>,
    },
    EnterPassive {
        done: Option<NotifyFn>,
    },
    StartSecureHandshake {
        done: Option<NotifyFn>,
    },
    SendRawData {
        data: Vec<u8>,
        done: NotifyFn,
    },
    RecvRawData {
        done: RawRecvFn,
    },
    Post(PostFn),
    RelayPush(RelayFrame),
    Stop {
        force: bool,
    },
}

impl std::fmt::Debug for ConnectionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionCommand::PushMessage { .. } => "PushMessage",
            ConnectionCommand::CancelMessage { .. } => "CancelMessage",
            ConnectionCommand::EnterActive { .. } => "EnterActive",
            ConnectionCommand::EnterPassive { .. } => "EnterPassive",
            ConnectionCommand::StartSecureHandshake { .. } => "StartSecureHandshake",
            ConnectionCommand::SendRawData { .. } => "SendRawData",
            ConnectionCommand::RecvRawData { .. } => "RecvRawData",
            ConnectionCommand::Post(_) => "Post",
            ConnectionCommand::RelayPush(_) => "RelayPush",
            ConnectionCommand::Stop { .. } => "Stop",
        };
        write!(f, "ConnectionCommand::{}", name)
    }
}

/// Which side of the socket this connection is, plus its transport seed.
pub(crate) enum ConnectionRole {
    Server {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    Client {
        addr: SocketAddr,
        server_name: String,
    },
}

/// Everything a spawned connection task needs.
pub(crate) struct ConnectionSetup {
    pub service: Weak<ServiceInner>,
    pub config: Arc<Configuration>,
    pub uid: RecipientId,
    pub pool_name: Option<String>,
    pub cmd_rx: UnboundedReceiver<ConnectionCommand>,
    pub cmd_tx: UnboundedSender<ConnectionCommand>,
    pub load: Arc<AtomicUsize>,
    pub role: ConnectionRole,
}

/// Outcome handed to the pool when the task ends; feeds the reconnect
/// schedule.
#[derive(Debug, Clone)]
pub(crate) struct StopReport {
    pub error: Option<Error>,
    pub was_connected: bool,
    pub was_active: bool,
    pub was_secured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Raw,
    Passive,
    Active,
    Stopping,
}

/// Inbound-traffic accounting for the inactivity and keep-alive rules.
///
/// Windows are consecutive periods of the inactivity timeout, re-anchored on
/// every data packet. A window with no traffic at all is an inactivity
/// failure. On the server, a run of windows sustained by keep-alives alone
/// is tolerated only up to the configured count: a peer that does nothing
/// but keep-alive for that long is failed.
struct RecvWindow {
    anchor: Instant,
    any: bool,
    data: bool,
    keepalive_windows: usize,
}

impl RecvWindow {
    fn new(now: Instant) -> Self {
        RecvWindow {
            anchor: now,
            any: false,
            data: false,
            keepalive_windows: 0,
        }
    }

    fn on_packet(&mut self, is_keepalive: bool) {
        self.any = true;
        if !is_keepalive {
            self.data = true;
        }
    }

    fn deadline(&self, timeout: Duration) -> Instant {
        self.anchor + timeout
    }

    fn on_elapsed(&mut self, now: Instant, is_server: bool, limit: usize) -> Result<(), Error> {
        if !self.any {
            return Err(Error::InactivityTimeout);
        }
        if self.data {
            self.keepalive_windows = 0;
        } else if is_server {
            self.keepalive_windows += 1;
            if self.keepalive_windows > limit {
                return Err(Error::TooManyKeepalive);
            }
        }
        self.anchor = now;
        self.any = false;
        self.data = false;
        Ok(())
    }
}

/// Raw send queued behind the current send buffer; `mark` is the buffer
/// offset whose flush completes it.
struct RawSendMark {
    mark: usize,
    done: NotifyFn,
}

enum LoopAction {
    None,
    SecureHandshake(Option<NotifyFn>),
    StopNow,
}

struct ConnectionDriver {
    service: Weak<ServiceInner>,
    config: Arc<Configuration>,
    protocol: Arc<Protocol>,
    codec: PacketCodec,
    uid: RecipientId,
    pool_name: Option<String>,
    cmd_tx: UnboundedSender<ConnectionCommand>,
    load: Arc<AtomicUsize>,
    is_server: bool,
    peer_addr: Option<SocketAddr>,
    server_name: String,

    phase: Phase,
    secured: bool,
    was_connected: bool,
    was_active: bool,

    writer: MessageWriter,
    reader: MessageReader,

    recv_window: RecvWindow,
    last_send: Instant,
    established_at: Instant,
    stopping_deadline: Option<Instant>,

    /// Out-of-band packets (KeepAlive, Accept, Error) ahead of writer output.
    control_out: Vec<Packet>,
    raw_out: Vec<(Vec<u8>, NotifyFn)>,
    raw_recv_pending: Option<RawRecvFn>,

    /// Relay sessions opened for messages this node is forwarding.
    relay_sessions: HashMap<u64, RelaySessionId>,
}

/// Entry point: drive one connection to completion and report its stop.
pub(crate) async fn run_connection(setup: ConnectionSetup) {
    let ConnectionSetup {
        service,
        config,
        uid,
        pool_name,
        mut cmd_rx,
        cmd_tx,
        load,
        role,
    } = setup;

    let is_server = matches!(role, ConnectionRole::Server { .. });
    let mut driver = ConnectionDriver {
        protocol: config.protocol.clone(),
        codec: PacketCodec::new(config.compression.clone()),
        writer: MessageWriter::new(config.writer.clone()),
        reader: MessageReader::new(config.reader.clone()),
        service,
        config,
        uid,
        pool_name,
        cmd_tx,
        load,
        is_server,
        peer_addr: None,
        server_name: String::new(),
        phase: Phase::Raw,
        secured: false,
        was_connected: false,
        was_active: false,
        recv_window: RecvWindow::new(Instant::now()),
        last_send: Instant::now(),
        established_at: Instant::now(),
        stopping_deadline: None,
        control_out: Vec::new(),
        raw_out: Vec::new(),
        raw_recv_pending: None,
        relay_sessions: HashMap::new(),
    };

    let result = driver.run(role, &mut cmd_rx).await;
    driver.finalize(result, &mut cmd_rx);
}

impl ConnectionDriver {
    async fn run(
        &mut self,
        role: ConnectionRole,
        cmd_rx: &mut UnboundedReceiver<ConnectionCommand>,
    ) -> Result<(), Error> {
        let establish_deadline = Instant::now() + ESTABLISH_TIMEOUT;
        let stream = self.establish(role, establish_deadline).await?;
        let stream = self.handshake_exchange(stream, establish_deadline).await?;

        self.established_at = Instant::now();
        self.recv_window = RecvWindow::new(self.established_at);
        self.last_send = self.established_at;

        let start_state = if self.is_server {
            self.config
                .server
                .as_ref()
                .map(|s| s.connection_start_state)
        } else {
            self.config
                .client
                .as_ref()
                .map(|c| c.connection_start_state)
        }
        .unwrap_or(ConfigConnectionState::Active);

        self.enter_start_state(start_state);
        self.event_loop(stream, cmd_rx).await
    }

    // -- establishment ------------------------------------------------------

    async fn establish(
        &mut self,
        role: ConnectionRole,
        deadline: Instant,
    ) -> Result<StreamBox, Error> {
        let (stream, peer_addr) = match role {
            ConnectionRole::Server { stream, peer_addr } => (stream, peer_addr),
            ConnectionRole::Client { addr, server_name } => {
                debug!(uid = ?self.uid, %addr, "connecting");
                let stream = timeout_at(deadline, TcpStream::connect(addr))
                    .await
                    .map_err(|_| Error::ConnectTimeout)?
                    .map_err(Error::from_connect)?;
                self.server_name = server_name;
                (stream, addr)
            }
        };
        self.peer_addr = Some(peer_addr);
        self.was_connected = true;
        self.tune_socket(&stream);

        let mut stream: StreamBox = Box::new(stream);

        let start_secure = if self.is_server {
            self.config
                .server
                .as_ref()
                .map(|s| s.connection_start_secure)
                .unwrap_or(false)
        } else {
            self.config
                .client
                .as_ref()
                .map(|c| c.connection_start_secure)
                .unwrap_or(false)
        };
        if start_secure {
            stream = self.secure_handshake(stream).await?;
        }
        Ok(stream)
    }

    /// Low-latency socket options, applied the same way on both roles.
    fn tune_socket(&self, stream: &TcpStream) {
        let sock = socket2::SockRef::from(stream);
        let _ = sock.set_nodelay(true);
        let _ = sock.set_recv_buffer_size(self.config.recv_buffer_max_capacity);
        let _ = sock.set_send_buffer_size(self.config.send_buffer_max_capacity);
    }

    async fn secure_handshake(&mut self, stream: StreamBox) -> Result<StreamBox, Error> {
        let transform = self
            .config
            .secure
            .clone()
            .ok_or(Error::NotConfigured("secure transform"))?;
        let secured_timeout = self
            .config
            .server
            .as_ref()
            .map(|s| s.timeout_secured)
            .unwrap_or(Duration::from_secs(20));
        let deadline = Instant::now() + secured_timeout;

        debug!(uid = ?self.uid, "secure handshake");
        let handshake = async {
            if self.is_server {
                transform.handshake_server(stream).await
            } else {
                transform.handshake_client(stream, &self.server_name).await
            }
        };
        let stream = timeout_at(deadline, handshake)
            .await
            .map_err(|_| Error::SecuredTimeout)??;
        self.secured = true;
        self.dispatch_event(ConnectionEvent::SecureHandshakeComplete);
        Ok(stream)
    }

    /// Connect/Accept exchange: version check, network ids, relay session
    /// confirmation.
    async fn handshake_exchange(
        &mut self,
        mut stream: StreamBox,
        deadline: Instant,
    ) -> Result<StreamBox, Error> {
        let (major, minor) = self.protocol.version();
        if self.is_server {
            let pkt = read_one_packet(&mut stream, &self.codec, deadline).await?;
            if pkt.packet_type != PacketType::Connect {
                return Err(Error::Handshake("expected Connect".into()));
            }
            let connect: ConnectData = bincode::deserialize(&pkt.payload)
                .map_err(|e| Error::Handshake(e.to_string()))?;
            if connect.version_major != major {
                let err_pkt = Packet::new(PacketType::Error, self.writer.allocate_packet_id());
                write_packet_to(&mut stream, &self.codec, &err_pkt, deadline).await?;
                return Err(Error::Handshake(format!(
                    "protocol version mismatch: peer {}.{}, local {}.{}",
                    connect.version_major, connect.version_minor, major, minor
                )));
            }
            // A Connect on an established relay session is idempotent: the
            // engine returns the session it already knows.
            let relay_id = match (&self.config.relay, connect.relay_id) {
                (Some(engine), remote) if remote != 0 => {
                    engine.connect_session(self.uid, remote)
                }
                _ => 0,
            };
            let accept = AcceptData {
                relay_id,
                timestamp_secs: connect.timestamp_secs,
                timestamp_nanos: connect.timestamp_nanos,
            };
            let mut pkt = Packet::new(PacketType::Accept, self.writer.allocate_packet_id());
            pkt.payload =
                bincode::serialize(&accept).map_err(|e| Error::Handshake(e.to_string()))?;
            write_packet_to(&mut stream, &self.codec, &pkt, deadline).await?;
        } else {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            let connect = ConnectData {
                version_major: major,
                version_minor: minor,
                sender_network_id: self.config.network_id,
                receiver_network_id: 0,
                timestamp_secs: now.as_secs(),
                timestamp_nanos: now.subsec_nanos(),
                relay_id: 0,
            };
            let mut pkt = Packet::new(PacketType::Connect, self.writer.allocate_packet_id());
            pkt.payload =
                bincode::serialize(&connect).map_err(|e| Error::Handshake(e.to_string()))?;
            write_packet_to(&mut stream, &self.codec, &pkt, deadline).await?;

            let pkt = read_one_packet(&mut stream, &self.codec, deadline).await?;
            match pkt.packet_type {
                PacketType::Accept => {
                    let _accept: AcceptData = bincode::deserialize(&pkt.payload)
                        .map_err(|e| Error::Handshake(e.to_string()))?;
                }
                PacketType::Error => {
                    return Err(Error::Handshake("peer rejected handshake".into()));
                }
                _ => return Err(Error::Handshake("expected Accept".into())),
            }
        }
        debug!(uid = ?self.uid, peer = ?self.peer_addr, "session established");
        Ok(stream)
    }

    fn enter_start_state(&mut self, start: ConfigConnectionState) {
        match start {
            ConfigConnectionState::Raw => {
                self.phase = Phase::Raw;
                self.dispatch_event(ConnectionEvent::EnteredRaw);
            }
            ConfigConnectionState::Passive => {
                self.phase = Phase::Passive;
                self.dispatch_event(ConnectionEvent::EnteredPassive);
            }
            ConfigConnectionState::Active => self.make_active(),
        }
        if let Some(hook) = self.config.connection_hooks.on_start.clone() {
            if let Some(mut ctx) = self.context() {
                hook(&mut ctx);
            }
        }
    }

    fn make_active(&mut self) {
        self.phase = Phase::Active;
        self.was_active = true;
        self.dispatch_event(ConnectionEvent::EnteredActive);
        if let Some(service) = self.service.upgrade() {
            service.on_connection_active(self.uid, self.pool_name.as_deref());
        }
    }

    // -- the event loop -----------------------------------------------------

    async fn event_loop(
        &mut self,
        stream: StreamBox,
        cmd_rx: &mut UnboundedReceiver<ConnectionCommand>,
    ) -> Result<(), Error> {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut recv_buf = vec![0u8; self.config.recv_buffer_start_capacity];
        let mut recv_len = 0usize;
        let mut send_buf: Vec<u8> = Vec::with_capacity(self.config.send_buffer_start_capacity);
        let mut send_off = 0usize;
        let mut raw_marks: Vec<RawSendMark> = Vec::new();

        loop {
            // Refill the send buffer once the previous one drained.
            if send_off == send_buf.len() && send_off != 0 {
                self.flush_raw_marks(&mut raw_marks, usize::MAX);
                send_buf.clear();
                send_off = 0;
            }
            if send_buf.is_empty() {
                self.fill_send_buffer(&mut send_buf, &mut raw_marks)?;
            }

            // A graceful stop completes once everything drained.
            if self.phase == Phase::Stopping
                && !self.writer.has_work()
                && send_off == send_buf.len()
                && self.control_out.is_empty()
            {
                return Ok(());
            }

            // Grow the receive buffer under backpressure.
            if recv_len == recv_buf.len() && recv_buf.len() < self.config.recv_buffer_max_capacity
            {
                let new_len = (recv_buf.len() * 2).min(self.config.recv_buffer_max_capacity);
                recv_buf.resize(new_len, 0);
            }

            let want_write = send_off < send_buf.len();
            let want_read = recv_len < recv_buf.len();
            let deadline = self.next_deadline();

            let action = tokio::select! {
                biased;
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &mut recv_buf, &mut recv_len)?,
                        // Service dropped: stop cleanly.
                        None => LoopAction::StopNow,
                    }
                }
                res = wr.write(&send_buf[send_off..]), if want_write => {
                    let n = res.map_err(Error::from_write)?;
                    if n == 0 {
                        return Err(Error::WriteError(Arc::new(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "socket write returned zero",
                        ))));
                    }
                    send_off += n;
                    self.last_send = Instant::now();
                    self.flush_raw_marks(&mut raw_marks, send_off);
                    LoopAction::None
                }
                res = rd.read(&mut recv_buf[recv_len..]), if want_read => {
                    let n = res.map_err(Error::from_read)?;
                    if n == 0 {
                        return Err(Error::PeerClosed);
                    }
                    recv_len += n;
                    self.on_bytes(&mut recv_buf, &mut recv_len)?;
                    LoopAction::None
                }
                _ = sleep_until(deadline) => {
                    self.on_deadline()?;
                    LoopAction::None
                }
            };

            match action {
                LoopAction::None => {}
                LoopAction::StopNow => return Ok(()),
                LoopAction::SecureHandshake(done) => {
                    // Reunite the halves, run the upgrade, split again.
                    let stream = rd.unsplit(wr);
                    let result = self.secure_handshake(stream).await;
                    match result {
                        Ok(stream) => {
                            let halves = tokio::io::split(stream);
                            rd = halves.0;
                            wr = halves.1;
                            self.notify(done, None);
                        }
                        Err(err) => {
                            self.notify(done, Some(&err));
                            return Err(err);
                        }
                    }
                }
            }
            self.publish_load();
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = Instant::now() + Duration::from_secs(3600);
        if self.phase != Phase::Raw {
            deadline = deadline.min(self.recv_window.deadline(self.config.inactivity_timeout));
            if !self.config.keepalive_timeout.is_zero() {
                deadline = deadline.min(self.last_send + self.config.keepalive_timeout);
            }
        }
        if self.is_server && self.phase != Phase::Active && self.phase != Phase::Stopping {
            if let Some(server) = &self.config.server {
                deadline = deadline.min(self.established_at + server.timeout_activation);
            }
        }
        if let Some(stop_deadline) = self.stopping_deadline {
            deadline = deadline.min(stop_deadline);
        }
        deadline
    }

    fn on_deadline(&mut self) -> Result<(), Error> {
        let now = Instant::now();

        if let Some(stop_deadline) = self.stopping_deadline {
            if now >= stop_deadline {
                // Grace expired; whatever is left drains as closed.
                return Err(Error::ConnectionClosed);
            }
        }

        // The activation clock ticks through Raw and Passive alike: a server
        // connection that never reaches Active in time is stopped.
        if self.is_server && self.phase != Phase::Active && self.phase != Phase::Stopping {
            if let Some(server) = &self.config.server {
                if now >= self.established_at + server.timeout_activation {
                    return Err(Error::SecuredTimeout);
                }
            }
        }

        if self.phase != Phase::Raw {
            if now >= self.recv_window.deadline(self.config.inactivity_timeout) {
                self.recv_window.on_elapsed(
                    now,
                    self.is_server,
                    self.config.inactivity_keepalive_count,
                )?;
            }
            if !self.config.keepalive_timeout.is_zero()
                && now >= self.last_send + self.config.keepalive_timeout
                && self.phase != Phase::Stopping
            {
                let pkt = Packet::keepalive(self.writer.allocate_packet_id());
                trace!(uid = ?self.uid, "keepalive");
                self.control_out.push(pkt);
                // The keep-alive is as good as sent: move the idle-outgoing
                // anchor so the timer does not re-fire while it flushes.
                self.last_send = now;
            }
        }
        Ok(())
    }

    fn fill_send_buffer(
        &mut self,
        send_buf: &mut Vec<u8>,
        raw_marks: &mut Vec<RawSendMark>,
    ) -> Result<(), Error> {
        for pkt in self.control_out.drain(..) {
            self.codec.write_packet(&pkt, send_buf)?;
        }
        for (data, done) in self.raw_out.drain(..) {
            send_buf.extend_from_slice(&data);
            raw_marks.push(RawSendMark {
                mark: send_buf.len(),
                done,
            });
        }
        if self.phase == Phase::Raw {
            return Ok(());
        }
        let mut completions = Vec::new();
        while send_buf.len() < self.config.send_buffer_start_capacity {
            match self.writer.produce_packet(&self.protocol, &mut completions) {
                Some(pkt) => {
                    self.codec.write_packet(&pkt, send_buf)?;
                    if let Some(service) = self.service.upgrade() {
                        service.statistic.note_packet_sent();
                    }
                }
                None => break,
            }
        }
        self.dispatch_completions(completions);
        Ok(())
    }

    fn flush_raw_marks(&mut self, raw_marks: &mut Vec<RawSendMark>, flushed: usize) {
        while raw_marks.first().map(|m| m.mark <= flushed).unwrap_or(false) {
            let mark = raw_marks.remove(0);
            self.notify(Some(mark.done), None);
        }
    }

    // -- inbound ------------------------------------------------------------

    fn on_bytes(&mut self, recv_buf: &mut Vec<u8>, recv_len: &mut usize) -> Result<(), Error> {
        if self.phase == Phase::Raw {
            if let Some(done) = self.raw_recv_pending.take() {
                let service = self.service.clone();
                if let Some(mut ctx) = context_for(&service, self) {
                    done(&mut ctx, Ok(&recv_buf[..*recv_len]));
                }
                *recv_len = 0;
            }
            return Ok(());
        }

        let mut at = 0usize;
        while at < *recv_len {
            match self.codec.read_packet(&recv_buf[at..*recv_len]) {
                ReadOutcome::Packet { packet, consumed } => {
                    at += consumed;
                    self.process_packet(packet)?;
                }
                ReadOutcome::NeedMore { .. } => break,
                ReadOutcome::Malformed(reason) => {
                    return Err(Error::FrameError(reason));
                }
            }
        }
        if at > 0 {
            recv_buf.copy_within(at..*recv_len, 0);
            *recv_len -= at;
        }
        Ok(())
    }

    fn process_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        let is_keepalive = pkt.packet_type == PacketType::KeepAlive;
        self.recv_window.on_packet(is_keepalive);
        if let Some(service) = self.service.upgrade() {
            service.statistic.note_packet_received();
        }

        for &acked in &pkt.updates {
            trace!(uid = ?self.uid, acked, "packet acknowledged by peer");
        }

        match pkt.packet_type {
            PacketType::KeepAlive | PacketType::Update => Ok(()),
            PacketType::Data => {
                if let Some(relay) = pkt.relay {
                    self.process_relay_packet(pkt, relay.relay_id)
                } else {
                    self.process_data_packet(pkt, 0)
                }
            }
            PacketType::Connect => {
                // Late Connect on an established session: confirm it again.
                let connect: ConnectData = bincode::deserialize(&pkt.payload)
                    .map_err(|_| Error::FrameError("bad connect payload"))?;
                let relay_id = match (&self.config.relay, connect.relay_id) {
                    (Some(engine), remote) if remote != 0 => {
                        engine.connect_session(self.uid, remote)
                    }
                    _ => 0,
                };
                let accept = AcceptData {
                    relay_id,
                    timestamp_secs: connect.timestamp_secs,
                    timestamp_nanos: connect.timestamp_nanos,
                };
                let mut reply = Packet::new(PacketType::Accept, self.writer.allocate_packet_id());
                reply.payload = bincode::serialize(&accept)
                    .map_err(|e| Error::SerializeError(e.to_string()))?;
                self.control_out.push(reply);
                Ok(())
            }
            PacketType::Accept => Ok(()),
            PacketType::Error => Err(Error::PeerClosed),
            PacketType::Unknown => Err(Error::FrameError("unknown packet type")),
        }
    }

    /// A RELAY-flagged Data packet: forward if this node runs an engine,
    /// otherwise it is addressed to us and reassembles scoped by session.
    fn process_relay_packet(&mut self, pkt: Packet, relay_id: u32) -> Result<(), Error> {
        if let Some(engine) = self.config.relay.clone() {
            let payload = Arc::new(pkt.payload);
            match engine.relay_packet(self.uid, relay_id, pkt.packet_id, payload) {
                Ok(()) => {
                    if let Some(service) = self.service.upgrade() {
                        service.statistic.note_packet_relayed();
                    }
                }
                Err(Error::RelayDuplicatePacket) => {
                    // Dropped at most once, never re-forwarded.
                    debug!(uid = ?self.uid, relay_id, "duplicate relay packet dropped");
                }
                Err(err) => {
                    warn!(uid = ?self.uid, relay_id, %err, "relay forward failed");
                }
            }
            self.writer.queue_ack(pkt.packet_id);
            return Ok(());
        }
        self.process_data_packet(pkt, relay_id)
    }

    fn process_data_packet(&mut self, pkt: Packet, relay_scope: u32) -> Result<(), Error> {
        let relay_enabled = self.config.relay.is_some();
        let mut events = Vec::new();
        self.reader.process_data_packet(
            &pkt,
            relay_scope,
            relay_enabled,
            &self.protocol,
            &mut events,
        )?;
        self.writer.queue_ack(pkt.packet_id);
        for event in events {
            self.dispatch_read_event(event);
        }
        Ok(())
    }

    fn dispatch_read_event(&mut self, event: ReadEvent) {
        match event {
            ReadEvent::Received { header, body } => {
                if let Some(service) = self.service.upgrade() {
                    service.statistic.note_message_received();
                }
                let receive_hook = self.protocol.receive_hook(header.type_id);
                let complete_hook = self.protocol.complete_hook(header.type_id);
                let service = self.service.clone();
                let Some(mut ctx) = context_for(&service, self) else {
                    return;
                };
                ctx.set_request(header.request_id, header.flags);
                if let Some(hook) = receive_hook {
                    hook(&mut ctx, body);
                } else if let Some(hook) = complete_hook {
                    hook(&mut ctx, None, Some(body), None);
                } else {
                    debug!(type_id = header.type_id, "message dropped: no handler");
                }
            }
            ReadEvent::Response {
                request_id,
                header,
                body,
            } => {
                let Some(wait) = self.writer.take_response_wait(request_id) else {
                    debug!(request_id, "response without a waiting request");
                    return;
                };
                if let Some(service) = self.service.upgrade() {
                    service.statistic.note_message_received();
                }
                let complete = self.protocol.complete_hook(wait.type_id);
                let service = self.service.clone();
                let Some(mut ctx) = context_for(&service, self) else {
                    return;
                };
                ctx.set_request(header.request_id, header.flags);
                if let Some(f) = wait.complete_fnc {
                    f(&mut ctx, Some(wait.message), Some(body), None);
                } else if let Some(hook) = complete {
                    hook(&mut ctx, Some(wait.message), Some(body), None);
                }
            }
            ReadEvent::MessageFailed {
                request_id,
                type_id,
                error,
            } => {
                debug!(request_id, type_id, %error, "inbound message failed");
                if let Some(service) = self.service.upgrade() {
                    service.statistic.note_message_failed();
                }
            }
            ReadEvent::RelayStart { header, data, last } => {
                self.relay_message_start(header, data, last);
            }
            ReadEvent::RelayContinue {
                request_id,
                data,
                last,
                cancel,
            } => {
                self.relay_message_continue(request_id, data, last, cancel);
            }
        }
    }

    fn relay_message_start(
        &mut self,
        header: crate::message::MessageHeader,
        data: Vec<u8>,
        last: bool,
    ) {
        let Some(engine) = self.config.relay.clone() else {
            return;
        };
        let name = header.relay_name.clone().unwrap_or_default();
        let request_id = header.request_id;
        let frames = reframe_start(&header, &data, last);
        let mut frames = frames.into_iter();
        let first = frames.next().expect("reframe yields at least one frame");
        match engine.relay_start(self.uid, &name, first) {
            Ok(session) => {
                let mut forwarded = true;
                for frame in frames {
                    if engine.relay_fragment(self.uid, session, frame).is_err() {
                        forwarded = false;
                        break;
                    }
                }
                if last || !forwarded {
                    engine.relay_done(self.uid, session);
                } else {
                    self.relay_sessions.insert(request_id, session);
                }
                if let Some(service) = self.service.upgrade() {
                    service.statistic.note_message_relayed();
                }
            }
            Err(err) => {
                debug!(name, request_id, %err, "relay start failed; message dropped");
            }
        }
    }

    fn relay_message_continue(&mut self, request_id: u64, data: Vec<u8>, last: bool, cancel: bool) {
        let Some(engine) = self.config.relay.clone() else {
            return;
        };
        let Some(&session) = self.relay_sessions.get(&request_id) else {
            // The session failed at start; swallow the remaining fragments.
            return;
        };
        for frame in reframe_continue(request_id, &data, last, cancel) {
            if engine.relay_fragment(self.uid, session, frame).is_err() {
                break;
            }
        }
        if last || cancel {
            engine.relay_done(self.uid, session);
            self.relay_sessions.remove(&request_id);
        }
    }

    // -- commands -----------------------------------------------------------

    fn handle_command(
        &mut self,
        cmd: ConnectionCommand,
        recv_buf: &mut Vec<u8>,
        recv_len: &mut usize,
    ) -> Result<LoopAction, Error> {
        match cmd {
            ConnectionCommand::PushMessage { msg_id, mut bundle } => {
                // Per-send flag adjustments from the type's prepare hook.
                if let Some(prepare) = self.protocol.prepare_hook(bundle.type_id) {
                    let service = self.service.clone();
                    if let Some(ctx) = context_for(&service, self) {
                        let extra = prepare(&ctx, &bundle.message);
                        bundle.flags.set(extra);
                    }
                }
                let admitted = match self.phase {
                    Phase::Active => true,
                    // Drain-only states still take responses for requests
                    // that already arrived.
                    Phase::Passive | Phase::Stopping => {
                        bundle.flags.has(MessageFlags::RESPONSE)
                    }
                    Phase::Raw => false,
                };
                if admitted {
                    let mut completions = Vec::new();
                    let protocol = self.protocol.clone();
                    self.writer
                        .push(msg_id, bundle, &protocol, &mut completions);
                    self.dispatch_completions(completions);
                } else {
                    self.fail_bundle(msg_id, bundle, Error::BadState("connection not active"));
                }
                Ok(LoopAction::None)
            }
            ConnectionCommand::CancelMessage { msg_id } => {
                let mut completions = Vec::new();
                self.writer.cancel(msg_id, &mut completions);
                self.dispatch_completions(completions);
                Ok(LoopAction::None)
            }
            ConnectionCommand::EnterActive { done } => {
                match self.phase {
                    Phase::Raw | Phase::Passive => {
                        self.make_active();
                        self.on_left_raw(recv_buf, recv_len)?;
                        self.notify(done, None);
                    }
                    Phase::Active => self.notify(done, None),
                    Phase::Stopping => {
                        self.notify(done, Some(&Error::BadState("connection stopping")))
                    }
                }
                Ok(LoopAction::None)
            }
            ConnectionCommand::EnterPassive { done } => {
                match self.phase {
                    Phase::Raw => {
                        self.phase = Phase::Passive;
                        self.dispatch_event(ConnectionEvent::EnteredPassive);
                        self.on_left_raw(recv_buf, recv_len)?;
                        self.notify(done, None);
                    }
                    Phase::Passive => self.notify(done, None),
                    Phase::Active | Phase::Stopping => {
                        self.notify(done, Some(&Error::BadState("cannot re-enter passive")))
                    }
                }
                Ok(LoopAction::None)
            }
            ConnectionCommand::StartSecureHandshake { done } => {
                if self.phase != Phase::Raw {
                    self.notify(done, Some(&Error::BadState("handshake requires raw state")));
                    Ok(LoopAction::None)
                } else if self.secured {
                    self.notify(done, None);
                    Ok(LoopAction::None)
                } else {
                    Ok(LoopAction::SecureHandshake(done))
                }
            }
            ConnectionCommand::SendRawData { data, done } => {
                if self.phase == Phase::Raw {
                    self.raw_out.push((data, done));
                } else {
                    self.notify(Some(done), Some(&Error::BadState("not in raw state")));
                }
                Ok(LoopAction::None)
            }
            ConnectionCommand::RecvRawData { done } => {
                if self.phase != Phase::Raw {
                    let service = self.service.clone();
                    if let Some(mut ctx) = context_for(&service, self) {
                        done(&mut ctx, Err(&Error::BadState("not in raw state")));
                    }
                } else if *recv_len > 0 {
                    let service = self.service.clone();
                    if let Some(mut ctx) = context_for(&service, self) {
                        done(&mut ctx, Ok(&recv_buf[..*recv_len]));
                    }
                    *recv_len = 0;
                } else if self.raw_recv_pending.is_some() {
                    let service = self.service.clone();
                    if let Some(mut ctx) = context_for(&service, self) {
                        done(&mut ctx, Err(&Error::BadState("raw receive already pending")));
                    }
                } else {
                    self.raw_recv_pending = Some(done);
                }
                Ok(LoopAction::None)
            }
            ConnectionCommand::Post(f) => {
                let service = self.service.clone();
                if let Some(mut ctx) = context_for(&service, self) {
                    f(&mut ctx);
                }
                Ok(LoopAction::None)
            }
            ConnectionCommand::RelayPush(frame) => {
                self.writer.push_relay_frame(frame);
                Ok(LoopAction::None)
            }
            ConnectionCommand::Stop { force } => {
                if force {
                    debug!(uid = ?self.uid, "force stop");
                    return Ok(LoopAction::StopNow);
                }
                if self.phase != Phase::Stopping {
                    debug!(uid = ?self.uid, "graceful stop, draining");
                    self.phase = Phase::Stopping;
                    self.stopping_deadline = Some(Instant::now() + STOPPING_GRACE);
                }
                Ok(LoopAction::None)
            }
        }
    }

    /// Any bytes buffered while Raw become protocol bytes on transition.
    fn on_left_raw(&mut self, recv_buf: &mut Vec<u8>, recv_len: &mut usize) -> Result<(), Error> {
        self.raw_recv_pending = None;
        self.recv_window = RecvWindow::new(Instant::now());
        if *recv_len > 0 {
            self.on_bytes(recv_buf, recv_len)?;
        }
        Ok(())
    }

    // -- dispatch helpers ---------------------------------------------------

    fn dispatch_completions(&mut self, completions: Vec<WriteCompletion>) {
        for completion in completions {
            match completion {
                WriteCompletion::Sent {
                    msg_id,
                    type_id,
                    message,
                    complete_fnc,
                } => {
                    trace!(uid = ?self.uid, ?msg_id, "message sent");
                    if let Some(service) = self.service.upgrade() {
                        service.statistic.note_message_sent();
                    }
                    self.complete_message(type_id, Some(message), None, None, complete_fnc);
                }
                WriteCompletion::Failed {
                    msg_id,
                    type_id,
                    message,
                    complete_fnc,
                    error,
                } => {
                    debug!(uid = ?self.uid, ?msg_id, %error, "message failed");
                    if let Some(service) = self.service.upgrade() {
                        service.statistic.note_message_failed();
                    }
                    self.complete_message(type_id, message, None, Some(&error), complete_fnc);
                }
            }
        }
        self.publish_load();
    }

    fn complete_message(
        &mut self,
        type_id: u16,
        sent: Option<MessagePtr>,
        recv: Option<MessagePtr>,
        error: Option<&Error>,
        complete_fnc: Option<SendCompleteFn>,
    ) {
        let hook = self.protocol.complete_hook(type_id);
        let service = self.service.clone();
        let Some(mut ctx) = context_for(&service, self) else {
            return;
        };
        if let Some(f) = complete_fnc {
            f(&mut ctx, sent, recv, error);
        } else if let Some(hook) = hook {
            hook(&mut ctx, sent, recv, error);
        }
    }

    fn fail_bundle(&mut self, _msg_id: MessageId, bundle: MessageBundle, error: Error) {
        if let Some(service) = self.service.upgrade() {
            service.statistic.note_message_failed();
        }
        self.complete_message(
            bundle.type_id,
            Some(bundle.message),
            None,
            Some(&error),
            bundle.complete_fnc,
        );
    }

    fn dispatch_event(&mut self, event: ConnectionEvent) {
        if let Some(hook) = self.config.connection_hooks.on_event.clone() {
            let service = self.service.clone();
            if let Some(mut ctx) = context_for(&service, self) {
                hook(&mut ctx, event);
            }
        }
    }

    fn notify(&mut self, done: Option<NotifyFn>, error: Option<&Error>) {
        if let Some(done) = done {
            let service = self.service.clone();
            if let Some(mut ctx) = context_for(&service, self) {
                done(&mut ctx, error);
            }
        }
    }

    fn context(&self) -> Option<ConnectionContext> {
        context_for(&self.service, self)
    }

    fn publish_load(&self) {
        self.load.store(self.writer.load(), Ordering::Relaxed);
    }

    // -- teardown -----------------------------------------------------------

    fn finalize(
        mut self,
        result: Result<(), Error>,
        cmd_rx: &mut UnboundedReceiver<ConnectionCommand>,
    ) {
        let error = result.err();
        let drain_error = error.clone().unwrap_or(Error::ConnectionClosed);

        // Commands already queued race with the stop; their messages drain
        // with the same error.
        cmd_rx.close();
        let protocol = self.protocol.clone();
        let mut completions = Vec::new();
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                ConnectionCommand::PushMessage { msg_id, bundle } => {
                    self.writer.push(msg_id, bundle, &protocol, &mut completions);
                }
                ConnectionCommand::SendRawData { data: _, done } => {
                    self.notify(Some(done), Some(&drain_error));
                }
                _ => {}
            }
        }
        self.writer.drain_all(&drain_error, &mut completions);
        self.dispatch_completions(completions);

        if let Some(engine) = &self.config.relay {
            engine.connection_stopped(self.uid);
        }

        match &error {
            Some(err) => debug!(uid = ?self.uid, %err, "connection stopped"),
            None => debug!(uid = ?self.uid, "connection stopped"),
        }

        if let Some(hook) = self.config.connection_hooks.on_stop.clone() {
            if let Some(mut ctx) = self.context() {
                hook(&mut ctx, error.as_ref());
            }
        }

        let report = StopReport {
            error,
            was_connected: self.was_connected,
            was_active: self.was_active,
            was_secured: self.secured,
        };
        if let Some(service) = self.service.upgrade() {
            service.on_connection_stopped(self.uid, self.pool_name.as_deref(), report);
        }
    }
}

fn context_for(service: &Weak<ServiceInner>, driver: &ConnectionDriver) -> Option<ConnectionContext> {
    let service = service.upgrade()?;
    Some(ConnectionContext::new(
        crate::service::Service::from_inner(service),
        driver.uid,
        driver.peer_addr,
        driver.cmd_tx.clone(),
    ))
}

// -- establishment I/O helpers ----------------------------------------------

async fn write_packet_to(
    stream: &mut StreamBox,
    codec: &PacketCodec,
    pkt: &Packet,
    deadline: Instant,
) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(pkt.buffer_size());
    codec.write_packet(pkt, &mut buf)?;
    timeout_at(deadline, stream.write_all(&buf))
        .await
        .map_err(|_| Error::ConnectTimeout)?
        .map_err(Error::from_write)
}

async fn read_one_packet(
    stream: &mut StreamBox,
    codec: &PacketCodec,
    deadline: Instant,
) -> Result<Packet, Error> {
    let mut buf = vec![0u8; PACKET_CAPACITY];
    let mut len = 0usize;
    loop {
        match codec.read_packet(&buf[..len]) {
            ReadOutcome::Packet { packet, consumed } => {
                // Handshake packets come one at a time; trailing bytes here
                // mean the peer jumped the gun.
                if consumed != len {
                    return Err(Error::Handshake("unexpected data after handshake packet".into()));
                }
                return Ok(packet);
            }
            ReadOutcome::NeedMore { .. } => {}
            ReadOutcome::Malformed(reason) => return Err(Error::FrameError(reason)),
        }
        let n = timeout_at(deadline, stream.read(&mut buf[len..]))
            .await
            .map_err(|_| Error::ConnectTimeout)?
            .map_err(Error::from_read)?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }
        len += n;
    }
}
