//! # Protocol Type Registry
//!
//! Bidirectional mapping between stable integer type ids and concrete
//! message types, together with their codecs and dispatch hooks. The
//! registry is built before the service starts and is read-only afterwards;
//! the service shares it behind an `Arc` with every connection.
//!
//! Per registered type up to three hooks exist:
//!
//! - `receive`: invoked for one-way arrivals,
//! - `complete`: invoked for the request/response lifecycle
//!   (`sent`, `recv`, error),
//! - `prepare`: invoked right before a send to adjust per-send flags.
//!
//! The service invokes exactly one of `receive`/`complete` per delivered
//! message, never both.
//!
//! ```no_run
//! # use mprpc::{Protocol, ConnectionContext};
//! # use serde::{Serialize, Deserialize};
//! #[derive(Serialize, Deserialize)]
//! struct Ping {
//!     text: String,
//! }
//!
//! let mut proto = Protocol::new(1, 0);
//! proto
//!     .register::<Ping>(1, "Ping")
//!     .with_receive(|ctx: &mut ConnectionContext, ping: Ping| {
//!         println!("got {}", ping.text);
//!     });
//! ```

use crate::error::Error;
use crate::message::{MessageFlags, MessagePtr};
use crate::service::ConnectionContext;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Hook for one-way message arrival.
pub type ReceiveFn = Arc<dyn Fn(&mut ConnectionContext, MessagePtr) + Send + Sync>;

/// Hook completing a message lifecycle: `(ctx, sent, recv, error)`.
pub type CompleteFn = Arc<
    dyn Fn(&mut ConnectionContext, Option<MessagePtr>, Option<MessagePtr>, Option<&Error>)
        + Send
        + Sync,
>;

/// Hook adjusting flags right before a send.
pub type PrepareFn = Arc<dyn Fn(&ConnectionContext, &MessagePtr) -> MessageFlags + Send + Sync>;

/// Per-send completion closure, consumed on first invocation. Overrides the
/// registry's `complete` hook for that one message.
pub type SendCompleteFn = Box<
    dyn FnOnce(&mut ConnectionContext, Option<MessagePtr>, Option<MessagePtr>, Option<&Error>)
        + Send,
>;

type SerializeFn = Arc<dyn Fn(&MessagePtr) -> Result<Vec<u8>, Error> + Send + Sync>;
type DeserializeFn = Arc<dyn Fn(&[u8], u64) -> Result<MessagePtr, Error> + Send + Sync>;

struct TypeHandler {
    name: &'static str,
    serialize_fnc: SerializeFn,
    deserialize_fnc: DeserializeFn,
    receive_fnc: Option<ReceiveFn>,
    complete_fnc: Option<CompleteFn>,
    prepare_fnc: Option<PrepareFn>,
}

/// The type registry. Keys are stable across a protocol version.
pub struct Protocol {
    version_major: u16,
    version_minor: u16,
    handlers: HashMap<u16, TypeHandler>,
    ids_by_type: HashMap<TypeId, u16>,
}

impl Protocol {
    pub fn new(version_major: u16, version_minor: u16) -> Self {
        Protocol {
            version_major,
            version_minor,
            handlers: HashMap::new(),
            ids_by_type: HashMap::new(),
        }
    }

    pub fn version(&self) -> (u16, u16) {
        (self.version_major, self.version_minor)
    }

    /// Register message type `T` under `type_id`.
    ///
    /// Panics on a duplicate id or type: registration is a setup-time
    /// programming error, not a runtime condition.
    pub fn register<T>(&mut self, type_id: u16, name: &'static str) -> TypeRegistration<'_, T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        assert!(
            !self.handlers.contains_key(&type_id),
            "type id {} registered twice",
            type_id
        );
        assert!(
            self.ids_by_type
                .insert(TypeId::of::<T>(), type_id)
                .is_none(),
            "message type {:?} registered twice",
            std::any::type_name::<T>()
        );

        let serialize_fnc: SerializeFn = Arc::new(|msg: &MessagePtr| {
            let value = msg
                .downcast_ref::<T>()
                .ok_or(Error::BadState("message body does not match its type id"))?;
            bincode::serialize(value).map_err(|e| Error::SerializeError(e.to_string()))
        });
        let deserialize_fnc: DeserializeFn = Arc::new(|bytes: &[u8], limit: u64| {
            let value: T = bincode::options()
                .with_fixint_encoding()
                .allow_trailing_bytes()
                .with_limit(limit)
                .deserialize(bytes)
                .map_err(|e| Error::DecodeError(e.to_string()))?;
            Ok(Box::new(value) as MessagePtr)
        });

        self.handlers.insert(
            type_id,
            TypeHandler {
                name,
                serialize_fnc,
                deserialize_fnc,
                receive_fnc: None,
                complete_fnc: None,
                prepare_fnc: None,
            },
        );
        TypeRegistration {
            handler: self.handlers.get_mut(&type_id).expect("just inserted"),
            _marker: PhantomData,
        }
    }

    /// Wire type id for a concrete message value.
    pub(crate) fn type_id_of(&self, msg: &MessagePtr) -> Option<u16> {
        self.ids_by_type.get(&(**msg).type_id()).copied()
    }

    pub(crate) fn type_name(&self, type_id: u16) -> &'static str {
        self.handlers
            .get(&type_id)
            .map(|h| h.name)
            .unwrap_or("<unregistered>")
    }

    pub(crate) fn serialize(&self, type_id: u16, msg: &MessagePtr) -> Result<Vec<u8>, Error> {
        let handler = self
            .handlers
            .get(&type_id)
            .ok_or(Error::TypeUnknown(type_id))?;
        (handler.serialize_fnc)(msg)
    }

    pub(crate) fn deserialize(
        &self,
        type_id: u16,
        bytes: &[u8],
        limit: u64,
    ) -> Result<MessagePtr, Error> {
        let handler = self
            .handlers
            .get(&type_id)
            .ok_or(Error::TypeUnknown(type_id))?;
        (handler.deserialize_fnc)(bytes, limit)
    }

    pub(crate) fn is_registered(&self, type_id: u16) -> bool {
        self.handlers.contains_key(&type_id)
    }

    pub(crate) fn receive_hook(&self, type_id: u16) -> Option<ReceiveFn> {
        self.handlers.get(&type_id)?.receive_fnc.clone()
    }

    pub(crate) fn complete_hook(&self, type_id: u16) -> Option<CompleteFn> {
        self.handlers.get(&type_id)?.complete_fnc.clone()
    }

    pub(crate) fn prepare_hook(&self, type_id: u16) -> Option<PrepareFn> {
        self.handlers.get(&type_id)?.prepare_fnc.clone()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("types", &self.handlers.len())
            .finish()
    }
}

/// Builder handle returned by [`Protocol::register`]; attaches the typed
/// hooks, wrapping each in the downcast shim the erased registry needs.
pub struct TypeRegistration<'a, T> {
    handler: &'a mut TypeHandler,
    _marker: PhantomData<T>,
}

impl<'a, T> TypeRegistration<'a, T>
where
    T: Send + 'static,
{
    pub fn with_receive<F>(self, f: F) -> Self
    where
        F: Fn(&mut ConnectionContext, T) + Send + Sync + 'static,
    {
        self.handler.receive_fnc = Some(Arc::new(move |ctx, ptr| {
            match ptr.downcast::<T>() {
                Ok(value) => f(ctx, *value),
                Err(_) => debug_assert!(false, "receive hook called with foreign body"),
            }
        }));
        self
    }

    pub fn with_complete<F>(self, f: F) -> Self
    where
        F: Fn(&mut ConnectionContext, Option<T>, Option<T>, Option<&Error>)
            + Send
            + Sync
            + 'static,
    {
        self.handler.complete_fnc = Some(Arc::new(move |ctx, sent, recv, err| {
            let sent = sent.and_then(|p| p.downcast::<T>().ok()).map(|b| *b);
            let recv = recv.and_then(|p| p.downcast::<T>().ok()).map(|b| *b);
            f(ctx, sent, recv, err)
        }));
        self
    }

    pub fn with_prepare<F>(self, f: F) -> Self
    where
        F: Fn(&ConnectionContext, &T) -> MessageFlags + Send + Sync + 'static,
    {
        self.handler.prepare_fnc = Some(Arc::new(move |ctx, ptr| {
            match ptr.downcast_ref::<T>() {
                Some(value) => f(ctx, value),
                None => MessageFlags::empty(),
            }
        }));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Blob {
        bytes: Vec<u8>,
    }

    #[test]
    fn serialize_round_trip_preserves_value() {
        let mut proto = Protocol::new(1, 0);
        proto.register::<Echo>(1, "Echo");

        let msg: MessagePtr = Box::new(Echo {
            text: "hello".to_owned(),
        });
        let type_id = proto.type_id_of(&msg).unwrap();
        assert_eq!(type_id, 1);

        let bytes = proto.serialize(type_id, &msg).unwrap();
        let back = proto.deserialize(type_id, &bytes, 1 << 20).unwrap();
        let back = back.downcast::<Echo>().unwrap();
        assert_eq!(back.text, "hello");
    }

    #[test]
    fn unknown_type_id_is_an_error() {
        let proto = Protocol::new(1, 0);
        let msg: MessagePtr = Box::new(Echo {
            text: "x".to_owned(),
        });
        assert!(proto.type_id_of(&msg).is_none());
        assert!(matches!(
            proto.serialize(9, &msg),
            Err(Error::TypeUnknown(9))
        ));
        assert!(matches!(
            proto.deserialize(9, &[], 1024),
            Err(Error::TypeUnknown(9))
        ));
    }

    #[test]
    fn deserialize_respects_size_limit() {
        let mut proto = Protocol::new(1, 0);
        proto.register::<Blob>(2, "Blob");

        let msg: MessagePtr = Box::new(Blob {
            bytes: vec![0; 4096],
        });
        let bytes = proto.serialize(2, &msg).unwrap();
        assert!(proto.deserialize(2, &bytes, 16).is_err());
        assert!(proto.deserialize(2, &bytes, 1 << 20).is_ok());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_id_panics() {
        let mut proto = Protocol::new(1, 0);
        proto.register::<Echo>(1, "Echo");
        proto.register::<Blob>(1, "Blob");
    }

    #[test]
    fn serialize_with_mismatched_id_fails() {
        let mut proto = Protocol::new(1, 0);
        proto.register::<Echo>(1, "Echo");
        proto.register::<Blob>(2, "Blob");

        let msg: MessagePtr = Box::new(Echo {
            text: "x".to_owned(),
        });
        assert!(proto.serialize(2, &msg).is_err());
    }
}
