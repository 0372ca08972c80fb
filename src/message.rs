//! # Message Model
//!
//! The unit of application payload. A message is any registered `serde` type;
//! inside the core it travels type-erased as a [`MessagePtr`] together with a
//! [`MessageHeader`] carrying the wire metadata: type id, request id, flags
//! and the optional relay name.
//!
//! Identity is handled with generation-indexed handles rather than references:
//! [`MessageId`] names a message within its pool, [`RecipientId`] names a
//! logical recipient across connection attempts. Stale handles simply fail to
//! resolve; no back-reference cycles exist anywhere in the core.

use std::any::Any;
use std::fmt;

/// Type-erased message body.
///
/// Bodies are boxed `Any` values; the protocol registry knows how to
/// serialize, deserialize and dispatch them per registered type id.
pub type MessagePtr = Box<dyn Any + Send>;

/// Per-message flag bits.
///
/// The low byte is the wire-visible subset and travels inside the fragment
/// header; the high byte is local bookkeeping and never leaves the process.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub(crate) u16);

impl MessageFlags {
    /// Strict ordering with other synchronous messages of the same pool.
    pub const SYNCHRONOUS: MessageFlags = MessageFlags(1 << 0);
    /// The sender expects a response with the same request id.
    pub const AWAIT_RESPONSE: MessageFlags = MessageFlags(1 << 1);
    /// This message is a response to a previously received request.
    pub const RESPONSE: MessageFlags = MessageFlags(1 << 2);
    /// A partial response; more response parts will follow.
    pub const RESPONSE_PART: MessageFlags = MessageFlags(1 << 3);
    /// Set while the message is on the peer side of its originating
    /// connection.
    pub const ON_PEER: MessageFlags = MessageFlags(1 << 4);
    /// The message travelled to the peer and back to its sender.
    pub const BACK_ON_SENDER: MessageFlags = MessageFlags(1 << 5);
    /// The message passed through at least one relay node.
    pub const RELAYED: MessageFlags = MessageFlags(1 << 6);

    /// Local only: the message was canceled by the caller.
    pub const CANCELED: MessageFlags = MessageFlags(1 << 8);
    /// Local only: never re-queue on connection failure; fail immediately.
    pub const ONE_SHOT_SEND: MessageFlags = MessageFlags(1 << 9);

    const WIRE_MASK: u16 = 0x00ff;

    pub fn empty() -> Self {
        MessageFlags(0)
    }

    pub fn has(self, other: MessageFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn set(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }

    pub fn unset(&mut self, other: MessageFlags) {
        self.0 &= !other.0;
    }

    /// The subset of bits that travels in the fragment header.
    pub fn wire_bits(self) -> u16 {
        self.0 & Self::WIRE_MASK
    }

    pub fn from_wire_bits(bits: u16) -> Self {
        MessageFlags(bits & Self::WIRE_MASK)
    }

    pub fn is_synchronous(self) -> bool {
        self.has(Self::SYNCHRONOUS)
    }

    pub fn is_response(self) -> bool {
        self.has(Self::RESPONSE)
    }

    pub fn awaits_response(self) -> bool {
        self.has(Self::AWAIT_RESPONSE)
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{}", s)
        };
        if self.has(Self::SYNCHRONOUS) {
            put(f, "sync")?;
        }
        if self.has(Self::AWAIT_RESPONSE) {
            put(f, "await_response")?;
        }
        if self.has(Self::RESPONSE) {
            put(f, "response")?;
        }
        if self.has(Self::RESPONSE_PART) {
            put(f, "response_part")?;
        }
        if self.has(Self::ON_PEER) {
            put(f, "on_peer")?;
        }
        if self.has(Self::BACK_ON_SENDER) {
            put(f, "back_on_sender")?;
        }
        if self.has(Self::RELAYED) {
            put(f, "relayed")?;
        }
        if self.has(Self::CANCELED) {
            put(f, "canceled")?;
        }
        if self.has(Self::ONE_SHOT_SEND) {
            put(f, "one_shot")?;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Identifier of a message within its originating pool.
///
/// `index` is the pool-local slot, `unique` the generation that guards
/// against stale handles. Encoded as a single `u64` it doubles as the wire
/// request id: a message is bound to exactly one connection once admitted,
/// so the encoding is unique within that connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub index: u32,
    pub unique: u32,
}

impl MessageId {
    pub const INVALID: MessageId = MessageId {
        index: u32::MAX,
        unique: u32::MAX,
    };

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn to_request_id(self) -> u64 {
        ((self.index as u64) << 32) | self.unique as u64
    }

    pub fn from_request_id(rid: u64) -> Self {
        MessageId {
            index: (rid >> 32) as u32,
            unique: rid as u32,
        }
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({}:{})", self.index, self.unique)
    }
}

/// Handle naming a logical recipient.
///
/// Outlives a single connection attempt: `pool_index` locates the pool (or
/// the sentinel for server-accepted connections outside any pool),
/// `connection_index` plus `unique` locate one connection generation in the
/// service's connection registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipientId {
    pub(crate) pool_index: u32,
    pub(crate) connection_index: u32,
    pub(crate) unique: u32,
}

impl RecipientId {
    pub(crate) const NO_POOL: u32 = u32::MAX;

    pub const INVALID: RecipientId = RecipientId {
        pool_index: u32::MAX,
        connection_index: u32::MAX,
        unique: u32::MAX,
    };

    pub fn is_valid(self) -> bool {
        self.connection_index != u32::MAX
    }

    pub(crate) fn has_pool(self) -> bool {
        self.pool_index != Self::NO_POOL
    }
}

impl fmt::Debug for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pool_index == Self::NO_POOL {
            write!(f, "RecipientId(-/{}:{})", self.connection_index, self.unique)
        } else {
            write!(
                f,
                "RecipientId({}/{}:{})",
                self.pool_index, self.connection_index, self.unique
            )
        }
    }
}

/// Wire metadata of one message, carried by its first fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub type_id: u16,
    pub request_id: u64,
    pub flags: MessageFlags,
    /// Desired forwarding path for relayed messages.
    pub relay_name: Option<String>,
}

impl MessageHeader {
    pub fn new(type_id: u16, request_id: u64, flags: MessageFlags) -> Self {
        MessageHeader {
            type_id,
            request_id,
            flags,
            relay_name: None,
        }
    }
}

/// Everything the pool hands a connection for one outgoing message.
pub(crate) struct MessageBundle {
    pub message: MessagePtr,
    pub type_id: u16,
    pub flags: MessageFlags,
    /// Desired forwarding path for relayed messages.
    pub relay_name: Option<String>,
    /// For responses: the request id of the request being answered. The
    /// writer stamps this on the wire instead of the message's own id so the
    /// peer can route the response to its waiting request.
    pub response_request_id: Option<u64>,
    /// Per-send completion closure; overrides the registry's `complete`
    /// hook for this message.
    pub complete_fnc: Option<crate::protocol::SendCompleteFn>,
}

impl std::fmt::Debug for MessageBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBundle")
            .field("type_id", &self.type_id)
            .field("flags", &self.flags)
            .field("relay_name", &self.relay_name)
            .field("has_complete_fnc", &self.complete_fnc.is_some())
            .finish()
    }
}
