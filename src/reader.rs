//! # Message Reader
//!
//! Consumes decoded Data packets, reassembles message fragments, and emits
//! [`ReadEvent`]s for the connection to dispatch. Reassemblies are keyed by
//! `(relay scope, request id)`: the relay scope is zero for direct traffic
//! and the relay session id for packets that arrived RELAY-flagged, so
//! relayed streams never collide with direct ones.
//!
//! Within one request id fragments are strictly ordered; a continuation
//! without a start (or a second start for a live id) means the framing is
//! corrupt and fails the connection. Across request ids arrival order is
//! free; that is the point of multiplexing.
//!
//! Message-scoped problems (an over-size reassembly, a decode failure, an
//! unknown type id) fail only that message: the reassembly turns into a
//! tombstone that swallows the remaining fragments, and the connection stays
//! up.
//!
//! On a relay node the reader does not reassemble name-addressed messages at
//! all: it surfaces their fragments as relay events for the engine to
//! forward.

use crate::config::ReaderConfiguration;
use crate::error::Error;
use crate::message::{MessageFlags, MessageHeader, MessagePtr};
use crate::packet::{decode_fragment, FragmentFlags, FragmentKind, Packet};
use crate::protocol::Protocol;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// What a processed packet produced.
pub(crate) enum ReadEvent {
    /// A complete one-way or request message.
    Received {
        header: MessageHeader,
        body: MessagePtr,
    },
    /// A complete response for a request awaiting it on this side.
    Response {
        request_id: u64,
        header: MessageHeader,
        body: MessagePtr,
    },
    /// A single message failed (size, decode, unknown type); the connection
    /// survives.
    MessageFailed {
        request_id: u64,
        type_id: u16,
        error: Error,
    },
    /// First fragment of a message this node must forward.
    RelayStart {
        header: MessageHeader,
        data: Vec<u8>,
        last: bool,
    },
    /// Continuation fragment of a message being forwarded.
    RelayContinue {
        request_id: u64,
        data: Vec<u8>,
        last: bool,
        cancel: bool,
    },
}

struct ReassemblyState {
    header: MessageHeader,
    data: Vec<u8>,
    is_response: bool,
    /// Tombstone: the message already failed, swallow fragments until LAST.
    failed: Option<Error>,
}

/// Per-connection inbound reassembler.
pub(crate) struct MessageReader {
    cfg: ReaderConfiguration,
    reassembly: HashMap<(u32, u64), ReassemblyState>,
    /// Request ids currently being forwarded rather than reassembled.
    relayed_requests: HashSet<u64>,
}

impl MessageReader {
    pub fn new(cfg: ReaderConfiguration) -> Self {
        MessageReader {
            cfg,
            reassembly: HashMap::new(),
            relayed_requests: HashSet::new(),
        }
    }

    /// Number of live reassemblies, tombstones included.
    pub fn reassembly_count(&self) -> usize {
        self.reassembly.len()
    }

    /// Process one Data packet.
    ///
    /// `relay_scope` is the relay id for RELAY-flagged packets, zero
    /// otherwise. `relay_enabled` marks this service as a relay node, which
    /// diverts name-addressed messages to relay events instead of local
    /// reassembly. A returned error is fatal for the connection.
    pub fn process_data_packet(
        &mut self,
        packet: &Packet,
        relay_scope: u32,
        relay_enabled: bool,
        protocol: &Protocol,
        events: &mut Vec<ReadEvent>,
    ) -> Result<(), Error> {
        let mut at = 0;
        while at < packet.payload.len() {
            let (fragment, data, used) = decode_fragment(&packet.payload[at..])?;
            at += used;
            self.process_fragment(fragment, data, relay_scope, relay_enabled, protocol, events)?;
        }
        Ok(())
    }

    fn process_fragment(
        &mut self,
        fragment: crate::packet::FragmentHeader,
        data: &[u8],
        relay_scope: u32,
        relay_enabled: bool,
        protocol: &Protocol,
        events: &mut Vec<ReadEvent>,
    ) -> Result<(), Error> {
        let request_id = fragment.request_id;
        let last = fragment.flags.has(FragmentFlags::LAST);
        let cancel = fragment.flags.has(FragmentFlags::CANCEL);
        let key = (relay_scope, request_id);

        // Cancel terminator: the sender abandoned the message.
        if cancel {
            if self.relayed_requests.remove(&request_id) {
                events.push(ReadEvent::RelayContinue {
                    request_id,
                    data: Vec::new(),
                    last: false,
                    cancel: true,
                });
                return Ok(());
            }
            if self.reassembly.remove(&key).is_some() {
                debug!(request_id, "partial message discarded on cancel");
            }
            return Ok(());
        }

        match fragment.kind {
            FragmentKind::New | FragmentKind::Old => {
                let header = fragment
                    .message
                    .ok_or(Error::FrameError("message start without header"))?;

                // A relay node forwards name-addressed messages unparsed.
                if relay_enabled && header.relay_name.is_some() {
                    if !last {
                        self.relayed_requests.insert(request_id);
                    }
                    events.push(ReadEvent::RelayStart {
                        header,
                        data: data.to_vec(),
                        last,
                    });
                    return Ok(());
                }

                if self.reassembly.contains_key(&key) {
                    return Err(Error::FrameError("second start for a live message"));
                }

                let mut header = header;
                if relay_scope != 0 {
                    header.flags.set(MessageFlags::RELAYED);
                }
                let is_response = fragment.kind == FragmentKind::Old;
                let failed = self.check_admission(&header, protocol, data.len());

                if last {
                    self.complete(header, data.to_vec(), is_response, failed, protocol, events);
                    return Ok(());
                }
                if failed.is_none()
                    && self.reassembly.len() >= self.cfg.max_message_count_multiplex
                {
                    return Err(Error::TooManyMultiplexedMessages);
                }
                self.reassembly.insert(
                    key,
                    ReassemblyState {
                        header,
                        data: if failed.is_none() {
                            data.to_vec()
                        } else {
                            Vec::new()
                        },
                        is_response,
                        failed,
                    },
                );
                Ok(())
            }
            FragmentKind::Continued => {
                if self.relayed_requests.contains(&request_id) {
                    if last {
                        self.relayed_requests.remove(&request_id);
                    }
                    events.push(ReadEvent::RelayContinue {
                        request_id,
                        data: data.to_vec(),
                        last,
                        cancel: false,
                    });
                    return Ok(());
                }

                let state = self
                    .reassembly
                    .get_mut(&key)
                    .ok_or(Error::FrameError("continuation without start"))?;

                if state.failed.is_none() {
                    if state.data.len() + data.len() > self.cfg.max_message_size {
                        state.failed = Some(Error::TooLarge);
                        state.data = Vec::new();
                    } else {
                        state.data.extend_from_slice(data);
                    }
                }
                if last {
                    let state = self.reassembly.remove(&key).expect("entry just borrowed");
                    self.complete(
                        state.header,
                        state.data,
                        state.is_response,
                        state.failed,
                        protocol,
                        events,
                    );
                }
                Ok(())
            }
        }
    }

    /// Message-scoped admission checks; a `Some` return marks the message
    /// failed without touching the connection.
    fn check_admission(
        &self,
        header: &MessageHeader,
        protocol: &Protocol,
        first_len: usize,
    ) -> Option<Error> {
        if !protocol.is_registered(header.type_id) {
            return Some(Error::TypeUnknown(header.type_id));
        }
        if first_len > self.cfg.max_message_size {
            return Some(Error::TooLarge);
        }
        None
    }

    fn complete(
        &mut self,
        header: MessageHeader,
        data: Vec<u8>,
        is_response: bool,
        failed: Option<Error>,
        protocol: &Protocol,
        events: &mut Vec<ReadEvent>,
    ) {
        if let Some(error) = failed {
            events.push(ReadEvent::MessageFailed {
                request_id: header.request_id,
                type_id: header.type_id,
                error,
            });
            return;
        }
        trace!(
            request_id = header.request_id,
            ty = protocol.type_name(header.type_id),
            len = data.len(),
            is_response,
            "message reassembled"
        );
        match protocol.deserialize(header.type_id, &data, self.cfg.max_message_size as u64) {
            Ok(body) => {
                if is_response {
                    events.push(ReadEvent::Response {
                        request_id: header.request_id,
                        header,
                        body,
                    });
                } else {
                    events.push(ReadEvent::Received { header, body });
                }
            }
            Err(error) => {
                events.push(ReadEvent::MessageFailed {
                    request_id: header.request_id,
                    type_id: header.type_id,
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfiguration;
    use crate::message::{MessageBundle, MessageId};
    use crate::writer::MessageWriter;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        bytes: Vec<u8>,
    }

    fn proto() -> Arc<Protocol> {
        let mut proto = Protocol::new(1, 0);
        proto.register::<Payload>(1, "Payload");
        Arc::new(proto)
    }

    fn push(
        writer: &mut MessageWriter,
        proto: &Protocol,
        index: u32,
        len: usize,
        flags: MessageFlags,
        relay_name: Option<&str>,
    ) {
        let mut completions = Vec::new();
        writer.push(
            MessageId { index, unique: 1 },
            MessageBundle {
                message: Box::new(Payload {
                    bytes: vec![index as u8; len],
                }),
                type_id: 1,
                flags,
                relay_name: relay_name.map(str::to_owned),
                response_request_id: None,
                complete_fnc: None,
            },
            proto,
            &mut completions,
        );
        assert!(completions.is_empty());
    }

    fn pump(
        writer: &mut MessageWriter,
        reader: &mut MessageReader,
        proto: &Protocol,
        relay_enabled: bool,
    ) -> Vec<ReadEvent> {
        let mut completions = Vec::new();
        let mut events = Vec::new();
        while let Some(pkt) = writer.produce_packet(proto, &mut completions) {
            if pkt.packet_type == crate::packet::PacketType::Data {
                reader
                    .process_data_packet(&pkt, 0, relay_enabled, proto, &mut events)
                    .unwrap();
            }
        }
        events
    }

    #[test]
    fn writer_to_reader_round_trip() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut reader = MessageReader::new(ReaderConfiguration::default());

        push(&mut writer, &proto, 3, 50_000, MessageFlags::empty(), None);
        let events = pump(&mut writer, &mut reader, &proto, false);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ReadEvent::Received { header, body } => {
                assert_eq!(header.type_id, 1);
                let payload = body.downcast_ref::<Payload>().unwrap();
                assert_eq!(payload.bytes.len(), 50_000);
                assert!(payload.bytes.iter().all(|&b| b == 3));
            }
            _ => panic!("expected Received"),
        }
        assert_eq!(reader.reassembly_count(), 0);
    }

    #[test]
    fn interleaved_messages_both_arrive() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut reader = MessageReader::new(ReaderConfiguration::default());

        push(&mut writer, &proto, 1, 9_000, MessageFlags::empty(), None);
        push(&mut writer, &proto, 2, 9_000, MessageFlags::empty(), None);
        let events = pump(&mut writer, &mut reader, &proto, false);

        let mut sizes: Vec<usize> = events
            .iter()
            .map(|e| match e {
                ReadEvent::Received { body, .. } => {
                    body.downcast_ref::<Payload>().unwrap().bytes.len()
                }
                _ => panic!("expected Received"),
            })
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![9_000, 9_000]);
    }

    #[test]
    fn response_routes_as_response_event() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut reader = MessageReader::new(ReaderConfiguration::default());
        let mut completions = Vec::new();

        writer.push(
            MessageId { index: 9, unique: 2 },
            MessageBundle {
                message: Box::new(Payload { bytes: vec![1] }),
                type_id: 1,
                flags: MessageFlags::RESPONSE,
                relay_name: None,
                response_request_id: Some(0xabcd),
                complete_fnc: None,
            },
            &proto,
            &mut completions,
        );
        let events = pump(&mut writer, &mut reader, &proto, false);
        match &events[0] {
            ReadEvent::Response { request_id, .. } => assert_eq!(*request_id, 0xabcd),
            _ => panic!("expected Response"),
        }
    }

    #[test]
    fn continuation_without_start_is_fatal() {
        let proto = proto();
        let mut reader = MessageReader::new(ReaderConfiguration::default());

        let mut pkt = Packet::new(crate::packet::PacketType::Data, 1);
        let header = crate::packet::FragmentHeader {
            kind: FragmentKind::Continued,
            flags: FragmentFlags::default(),
            request_id: 5,
            message: None,
        };
        crate::packet::encode_fragment_header(&header, 3, &mut pkt.payload);
        pkt.payload.extend_from_slice(&[1, 2, 3]);

        let mut events = Vec::new();
        assert!(matches!(
            reader.process_data_packet(&pkt, 0, false, &proto, &mut events),
            Err(Error::FrameError(_))
        ));
    }

    #[test]
    fn multiplex_limit_fails_connection() {
        let proto = proto();
        let mut cfg = ReaderConfiguration::default();
        cfg.max_message_count_multiplex = 2;
        let mut reader = MessageReader::new(cfg);

        // Three open (not-last) message starts.
        let mut result = Ok(());
        for rid in 0..3u64 {
            let mut pkt = Packet::new(crate::packet::PacketType::Data, rid as u32 + 1);
            let header = crate::packet::FragmentHeader {
                kind: FragmentKind::New,
                flags: FragmentFlags::default(),
                request_id: rid,
                message: Some(MessageHeader::new(1, rid, MessageFlags::empty())),
            };
            crate::packet::encode_fragment_header(&header, 4, &mut pkt.payload);
            pkt.payload.extend_from_slice(&[0; 4]);
            let mut events = Vec::new();
            result = reader.process_data_packet(&pkt, 0, false, &proto, &mut events);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::TooManyMultiplexedMessages)));
    }

    #[test]
    fn oversize_message_fails_only_itself() {
        let proto = proto();
        let mut cfg = ReaderConfiguration::default();
        cfg.max_message_size = 4096;
        let mut reader = MessageReader::new(cfg);

        let mut writer = MessageWriter::new(WriterConfiguration::default());
        push(&mut writer, &proto, 1, 10_000, MessageFlags::empty(), None);
        let events = pump(&mut writer, &mut reader, &proto, false);
        assert!(matches!(
            events[0],
            ReadEvent::MessageFailed {
                error: Error::TooLarge,
                ..
            }
        ));
        assert_eq!(reader.reassembly_count(), 0);

        // The connection keeps working for the next message.
        push(&mut writer, &proto, 2, 100, MessageFlags::empty(), None);
        let events = pump(&mut writer, &mut reader, &proto, false);
        assert!(matches!(events[0], ReadEvent::Received { .. }));
    }

    #[test]
    fn unknown_type_fails_only_the_message() {
        // A protocol that knows nothing receives a typed message.
        let empty_proto = Arc::new(Protocol::new(1, 0));
        let send_proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut reader = MessageReader::new(ReaderConfiguration::default());

        push(&mut writer, &send_proto, 1, 64, MessageFlags::empty(), None);
        let mut completions = Vec::new();
        let pkt = writer.produce_packet(&send_proto, &mut completions).unwrap();
        let mut events = Vec::new();
        reader
            .process_data_packet(&pkt, 0, false, &empty_proto, &mut events)
            .unwrap();
        assert!(matches!(
            events[0],
            ReadEvent::MessageFailed {
                error: Error::TypeUnknown(1),
                ..
            }
        ));
    }

    #[test]
    fn cancel_terminator_discards_partial() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut reader = MessageReader::new(ReaderConfiguration::default());
        let mut completions = Vec::new();
        let mut events = Vec::new();

        push(&mut writer, &proto, 1, 20_000, MessageFlags::empty(), None);
        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        reader
            .process_data_packet(&pkt, 0, false, &proto, &mut events)
            .unwrap();
        assert_eq!(reader.reassembly_count(), 1);

        writer.cancel(MessageId { index: 1, unique: 1 }, &mut completions);
        while let Some(pkt) = writer.produce_packet(&proto, &mut completions) {
            if pkt.packet_type == crate::packet::PacketType::Data {
                reader
                    .process_data_packet(&pkt, 0, false, &proto, &mut events)
                    .unwrap();
            }
        }
        assert_eq!(reader.reassembly_count(), 0);
        assert!(events.is_empty(), "no delivery for a canceled message");
    }

    #[test]
    fn relay_node_emits_relay_events() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut reader = MessageReader::new(ReaderConfiguration::default());

        push(
            &mut writer,
            &proto,
            1,
            9_000,
            MessageFlags::empty(),
            Some("beta"),
        );
        let events = pump(&mut writer, &mut reader, &proto, true);

        assert!(matches!(events[0], ReadEvent::RelayStart { .. }));
        let mut total = 0;
        let mut saw_last = false;
        for event in &events {
            match event {
                ReadEvent::RelayStart { header, data, last } => {
                    assert_eq!(header.relay_name.as_deref(), Some("beta"));
                    total += data.len();
                    saw_last |= last;
                }
                ReadEvent::RelayContinue {
                    data, last, cancel, ..
                } => {
                    assert!(!cancel);
                    total += data.len();
                    saw_last |= last;
                }
                _ => panic!("expected relay events only"),
            }
        }
        assert!(saw_last);
        assert_eq!(total, 9_000 + 8);
        assert_eq!(reader.reassembly_count(), 0, "relay node never reassembles");
    }
}
