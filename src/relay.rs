//! # Relay Engine
//!
//! A relay node moves message fragments between two of its connections
//! without deserializing the bodies. The first fragment of a relayed message
//! carries the destination name in its header; the engine resolves the name
//! to a registered connection, opens a relay session, and forwards that
//! fragment and every continuation as RELAY-flagged Data packets stamped
//! with the session id. Whole-packet forwarding (node-to-node hops) rewrites
//! only the relay id field and never touches the payload.
//!
//! Forwarded payloads are frozen reference-counted buffers so the source
//! actor can release its receive buffer while destination actors still hold
//! the frames. Per session the engine preserves FIFO order; across sessions
//! no order is defined. A duplicate packet id on a session is dropped, never
//! re-forwarded.

use crate::connection::ConnectionCommand;
use crate::error::Error;
use crate::message::RecipientId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// One forwarded fragment: the destination-local session id plus the frozen
/// fragment bytes the destination writer emits verbatim.
#[derive(Clone)]
pub(crate) struct RelayFrame {
    pub relay_id: u32,
    pub payload: Arc<Vec<u8>>,
}

impl std::fmt::Debug for RelayFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayFrame")
            .field("relay_id", &self.relay_id)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Handle to a destination connection held by the engine.
#[derive(Clone)]
pub struct RelayConnection {
    pub(crate) uid: RecipientId,
    pub(crate) sender: UnboundedSender<ConnectionCommand>,
}

/// Session id handed back by [`RelayEngine::relay_start`]; scopes the
/// continuation fragments of one relayed message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelaySessionId(pub u32);

/// Pluggable packet forwarder.
///
/// The service calls `register_connection_name` when a connection activates
/// under a relay name and `connection_stopped` when it goes away; the
/// reader-side of a relay node calls `relay_start`/`relay_fragment` for
/// name-addressed messages and `relay_packet` for already-framed relay
/// packets.
pub trait RelayEngine: Send + Sync {
    /// Register `conn` as the destination for `name`. Returns false if the
    /// name is already taken by a live connection.
    fn register_connection_name(&self, name: &str, conn: RelayConnection) -> bool;

    /// Drop every registration and session involving `uid`.
    fn connection_stopped(&self, uid: RecipientId);

    /// Open a relay session for a message addressed to `name` arriving on
    /// `src` and forward its first fragment.
    fn relay_start(
        &self,
        src: RecipientId,
        name: &str,
        frame: Arc<Vec<u8>>,
    ) -> Result<RelaySessionId, Error>;

    /// Forward a continuation fragment on an established session.
    fn relay_fragment(
        &self,
        src: RecipientId,
        session: RelaySessionId,
        frame: Arc<Vec<u8>>,
    ) -> Result<(), Error>;

    /// Close a session after its last fragment was forwarded.
    fn relay_done(&self, src: RecipientId, session: RelaySessionId);

    /// Forward a whole RELAY-flagged packet on a known session, rewriting
    /// the relay id. Duplicate packet ids are dropped.
    fn relay_packet(
        &self,
        src: RecipientId,
        relay_id: u32,
        packet_id: u32,
        payload: Arc<Vec<u8>>,
    ) -> Result<(), Error>;

    /// Confirm (or create, idempotently) the session advertised by a peer's
    /// Connect record. Returns the local relay id to echo in the Accept.
    fn connect_session(&self, src: RecipientId, remote_relay_id: u32) -> u32;
}

/// Re-encode the opening fragment of a relayed message for forwarding.
///
/// The destination name is consumed by this hop and dropped from the header;
/// the RELAYED flag stays set so the final recipient can tell. Bodies are
/// never touched, but a fragment may be split so every produced frame fits a
/// relay-flagged packet ([`RELAY_FRAME_MAX`]).
pub(crate) fn reframe_start(
    header: &crate::message::MessageHeader,
    data: &[u8],
    last: bool,
) -> Vec<Arc<Vec<u8>>> {
    use crate::packet::{
        encode_fragment_header, FragmentFlags, FragmentHeader, FragmentKind, RELAY_FRAME_MAX,
    };

    let mut forwarded = header.clone();
    forwarded.relay_name = None;

    let kind = if header.flags.is_response() {
        FragmentKind::Old
    } else {
        FragmentKind::New
    };
    let mut frames = Vec::new();
    let mut fh = FragmentHeader {
        kind,
        flags: FragmentFlags::default(),
        request_id: header.request_id,
        message: Some(forwarded),
    };
    let take = data.len().min(RELAY_FRAME_MAX - fh.encoded_len());
    if last && take == data.len() {
        fh.flags.set(FragmentFlags::LAST);
    }
    let mut buf = Vec::with_capacity(fh.encoded_len() + take);
    encode_fragment_header(&fh, take as u16, &mut buf);
    buf.extend_from_slice(&data[..take]);
    frames.push(Arc::new(buf));

    if take < data.len() {
        frames.extend(reframe_continue(header.request_id, &data[take..], last, false));
    }
    frames
}

/// Re-encode a continuation (or cancel terminator) fragment for forwarding.
pub(crate) fn reframe_continue(
    request_id: u64,
    data: &[u8],
    last: bool,
    cancel: bool,
) -> Vec<Arc<Vec<u8>>> {
    use crate::packet::{
        encode_fragment_header, FragmentFlags, FragmentHeader, FragmentKind, RELAY_FRAME_MAX,
    };

    let mut frames = Vec::new();
    let mut at = 0;
    loop {
        let mut fh = FragmentHeader {
            kind: FragmentKind::Continued,
            flags: FragmentFlags::default(),
            request_id,
            message: None,
        };
        let take = (data.len() - at).min(RELAY_FRAME_MAX - fh.encoded_len());
        let is_tail = at + take == data.len();
        if cancel {
            fh.flags.set(FragmentFlags::CANCEL);
        } else if last && is_tail {
            fh.flags.set(FragmentFlags::LAST);
        }
        let mut buf = Vec::with_capacity(fh.encoded_len() + take);
        encode_fragment_header(&fh, take as u16, &mut buf);
        buf.extend_from_slice(&data[at..at + take]);
        frames.push(Arc::new(buf));
        at += take;
        if is_tail {
            break;
        }
    }
    frames
}

struct RelaySession {
    src: RecipientId,
    dst: RecipientId,
    dst_sender: UnboundedSender<ConnectionCommand>,
    /// Packet ids already forwarded on this session.
    seen_packet_ids: HashSet<u32>,
    /// Bounded eviction order for `seen_packet_ids`.
    seen_order: VecDeque<u32>,
}

const SEEN_PACKET_WINDOW: usize = 1024;

impl RelaySession {
    fn note_packet(&mut self, packet_id: u32) -> bool {
        if !self.seen_packet_ids.insert(packet_id) {
            return false;
        }
        self.seen_order.push_back(packet_id);
        if self.seen_order.len() > SEEN_PACKET_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_packet_ids.remove(&old);
            }
        }
        true
    }
}

#[derive(Default)]
struct EngineState {
    names: HashMap<String, RelayConnection>,
    sessions: HashMap<u32, RelaySession>,
    /// (source connection, remote relay id) -> local session id, for
    /// idempotent Connect handling.
    connect_map: HashMap<(RecipientId, u32), u32>,
    next_session_id: u32,
}

impl EngineState {
    fn allocate_session(
        &mut self,
        src: RecipientId,
        dst: RecipientId,
        dst_sender: UnboundedSender<ConnectionCommand>,
    ) -> u32 {
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
        let id = self.next_session_id;
        self.sessions.insert(
            id,
            RelaySession {
                src,
                dst,
                dst_sender,
                seen_packet_ids: HashSet::new(),
                seen_order: VecDeque::new(),
            },
        );
        id
    }
}

/// In-process relay engine keyed by registered connection names.
#[derive(Default)]
pub struct BasicRelayEngine {
    state: Mutex<EngineState>,
}

impl BasicRelayEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(BasicRelayEngine::default())
    }

    fn forward(
        sender: &UnboundedSender<ConnectionCommand>,
        relay_id: u32,
        frame: Arc<Vec<u8>>,
    ) -> Result<(), Error> {
        sender
            .send(ConnectionCommand::RelayPush(RelayFrame {
                relay_id,
                payload: frame,
            }))
            .map_err(|_| Error::RelayForwardFailed)
    }
}

impl RelayEngine for BasicRelayEngine {
    fn register_connection_name(&self, name: &str, conn: RelayConnection) -> bool {
        let mut state = self.state.lock();
        if let Some(existing) = state.names.get(name) {
            if !existing.sender.is_closed() && existing.uid != conn.uid {
                warn!(name, "relay name already registered");
                return false;
            }
        }
        debug!(name, uid = ?conn.uid, "relay name registered");
        state.names.insert(name.to_owned(), conn);
        true
    }

    fn connection_stopped(&self, uid: RecipientId) {
        let mut state = self.state.lock();
        state.names.retain(|_, c| c.uid != uid);
        state.sessions.retain(|_, s| s.src != uid && s.dst != uid);
        state.connect_map.retain(|(src, _), _| *src != uid);
    }

    fn relay_start(
        &self,
        src: RecipientId,
        name: &str,
        frame: Arc<Vec<u8>>,
    ) -> Result<RelaySessionId, Error> {
        let mut state = self.state.lock();
        let conn = state
            .names
            .get(name)
            .filter(|c| !c.sender.is_closed())
            .cloned()
            .ok_or_else(|| Error::RelayUnknownName(name.to_owned()))?;
        let id = state.allocate_session(src, conn.uid, conn.sender.clone());
        drop(state);

        debug!(name, session = id, "relay session opened");
        Self::forward(&conn.sender, id, frame).map(|_| RelaySessionId(id))
    }

    fn relay_fragment(
        &self,
        src: RecipientId,
        session: RelaySessionId,
        frame: Arc<Vec<u8>>,
    ) -> Result<(), Error> {
        let state = self.state.lock();
        let sess = state
            .sessions
            .get(&session.0)
            .filter(|s| s.src == src)
            .ok_or(Error::RelayUnknownSession)?;
        let sender = sess.dst_sender.clone();
        drop(state);
        Self::forward(&sender, session.0, frame)
    }

    fn relay_done(&self, src: RecipientId, session: RelaySessionId) {
        let mut state = self.state.lock();
        if state
            .sessions
            .get(&session.0)
            .map(|s| s.src == src)
            .unwrap_or(false)
        {
            state.sessions.remove(&session.0);
            debug!(session = session.0, "relay session closed");
        }
    }

    fn relay_packet(
        &self,
        src: RecipientId,
        relay_id: u32,
        packet_id: u32,
        payload: Arc<Vec<u8>>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let sess = state
            .sessions
            .get_mut(&relay_id)
            .filter(|s| s.src == src)
            .ok_or(Error::RelayUnknownSession)?;
        if !sess.note_packet(packet_id) {
            debug!(relay_id, packet_id, "duplicate relayed packet dropped");
            return Err(Error::RelayDuplicatePacket);
        }
        let sender = sess.dst_sender.clone();
        drop(state);
        Self::forward(&sender, relay_id, payload)
    }

    fn connect_session(&self, src: RecipientId, remote_relay_id: u32) -> u32 {
        let mut state = self.state.lock();
        if let Some(&local) = state.connect_map.get(&(src, remote_relay_id)) {
            // Idempotent: a Connect re-sent on an established session
            // confirms it instead of creating a duplicate.
            return local;
        }
        state.next_session_id = state.next_session_id.wrapping_add(1).max(1);
        let local = state.next_session_id;
        state.connect_map.insert((src, remote_relay_id), local);
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn uid(n: u32) -> RecipientId {
        RecipientId {
            pool_index: RecipientId::NO_POOL,
            connection_index: n,
            unique: 0,
        }
    }

    fn conn(n: u32) -> (RelayConnection, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RelayConnection {
                uid: uid(n),
                sender: tx,
            },
            rx,
        )
    }

    fn frame(bytes: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(bytes.to_vec())
    }

    #[tokio::test]
    async fn start_and_fragment_preserve_order() {
        let engine = BasicRelayEngine::new();
        let (dst, mut rx) = conn(2);
        assert!(engine.register_connection_name("beta", dst));

        let session = engine
            .relay_start(uid(1), "beta", frame(b"first"))
            .unwrap();
        engine
            .relay_fragment(uid(1), session, frame(b"second"))
            .unwrap();

        for expected in [&b"first"[..], &b"second"[..]] {
            match rx.recv().await.unwrap() {
                ConnectionCommand::RelayPush(f) => assert_eq!(&f.payload[..], expected),
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn unknown_name_and_session_fail() {
        let engine = BasicRelayEngine::new();
        assert!(matches!(
            engine.relay_start(uid(1), "nobody", frame(b"x")),
            Err(Error::RelayUnknownName(_))
        ));
        assert!(matches!(
            engine.relay_fragment(uid(1), RelaySessionId(99), frame(b"x")),
            Err(Error::RelayUnknownSession)
        ));
    }

    #[tokio::test]
    async fn duplicate_packet_is_dropped_once() {
        let engine = BasicRelayEngine::new();
        let (dst, mut rx) = conn(2);
        engine.register_connection_name("beta", dst);
        let session = engine.relay_start(uid(1), "beta", frame(b"hdr")).unwrap();

        engine
            .relay_packet(uid(1), session.0, 10, frame(b"payload"))
            .unwrap();
        assert!(matches!(
            engine.relay_packet(uid(1), session.0, 10, frame(b"payload")),
            Err(Error::RelayDuplicatePacket)
        ));

        // Exactly two frames went through: the start and one packet copy.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_session_is_idempotent() {
        let engine = BasicRelayEngine::new();
        let a = engine.connect_session(uid(1), 77);
        let b = engine.connect_session(uid(1), 77);
        assert_eq!(a, b);
        // A different remote id yields a fresh session.
        assert_ne!(a, engine.connect_session(uid(1), 78));
    }

    #[tokio::test]
    async fn stopped_connection_unregisters() {
        let engine = BasicRelayEngine::new();
        let (dst, _rx) = conn(2);
        engine.register_connection_name("beta", dst);
        engine.connection_stopped(uid(2));
        assert!(engine.relay_start(uid(1), "beta", frame(b"x")).is_err());
    }
}
