//! # Message Writer
//!
//! Turns a stream of outgoing messages into a stream of packets. Messages
//! are serialized on admission to an in-flight slot ring (bounded by the
//! writer multiplex cap) and fragmented round-robin across packets, so many
//! logical messages share the wire fairly. Synchronous messages go through a
//! single-slot lane: one synchronous message drains completely before the
//! next one starts.
//!
//! Every produced packet may piggyback acknowledgments of recently received
//! packet ids; with nothing else to send, pending acks go out in an
//! Update-only packet. Relay frames handed over by the relay engine take
//! precedence over local fragments since they hold foreign buffers alive.
//!
//! Cancellation removes a message outright if it never hit the wire, or
//! emits a cancel-terminator fragment so the peer discards the partial
//! reassembly.

use crate::config::WriterConfiguration;
use crate::error::Error;
use crate::message::{MessageBundle, MessageFlags, MessageHeader, MessageId, MessagePtr};
use crate::packet::{
    encode_fragment_header, FragmentFlags, FragmentHeader, FragmentKind, Packet, PacketType,
    MAX_UPDATE_COUNT,
};
use crate::protocol::{Protocol, SendCompleteFn};
use crate::relay::RelayFrame;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Lifecycle event surfaced to the connection, which dispatches the actual
/// completion hooks.
pub(crate) enum WriteCompletion {
    /// Fully written, no response expected.
    Sent {
        msg_id: MessageId,
        type_id: u16,
        message: MessagePtr,
        complete_fnc: Option<SendCompleteFn>,
    },
    /// Failed or canceled before completion.
    Failed {
        msg_id: MessageId,
        type_id: u16,
        message: Option<MessagePtr>,
        complete_fnc: Option<SendCompleteFn>,
        error: Error,
    },
}

/// A fully written request awaiting its response.
pub(crate) struct ResponseWait {
    pub msg_id: MessageId,
    pub type_id: u16,
    pub message: MessagePtr,
    pub complete_fnc: Option<SendCompleteFn>,
}

struct PendingMessage {
    msg_id: MessageId,
    bundle: MessageBundle,
}

struct WriteSlot {
    msg_id: MessageId,
    request_id: u64,
    type_id: u16,
    flags: MessageFlags,
    relay_name: Option<String>,
    data: Vec<u8>,
    offset: usize,
    started: bool,
    canceled: bool,
    is_sync: bool,
    message: MessagePtr,
    complete_fnc: Option<SendCompleteFn>,
}

impl WriteSlot {
    fn wire_header(&self) -> MessageHeader {
        let mut header = MessageHeader::new(self.type_id, self.request_id, self.flags);
        header.relay_name = self.relay_name.clone();
        header
    }
}

enum FragOutcome {
    /// No room left in this packet for the slot's next fragment.
    NoSpace,
    /// A fragment was emitted; more remain.
    Progress,
    /// The final fragment (or cancel terminator) was emitted.
    Finished,
    /// Canceled before any byte hit the wire; nothing was emitted.
    FinishedSilently,
}

/// Per-connection outgoing multiplexer.
pub(crate) struct MessageWriter {
    cfg: WriterConfiguration,
    slots: Vec<WriteSlot>,
    rr_cursor: usize,
    sync_active: bool,
    sync_waiting: VecDeque<PendingMessage>,
    async_waiting: VecDeque<PendingMessage>,
    response_waits: HashMap<u64, ResponseWait>,
    pending_acks: VecDeque<u32>,
    relay_frames: VecDeque<RelayFrame>,
    next_packet_id: u32,
}

impl MessageWriter {
    pub fn new(cfg: WriterConfiguration) -> Self {
        MessageWriter {
            cfg,
            slots: Vec::new(),
            rr_cursor: 0,
            sync_active: false,
            sync_waiting: VecDeque::new(),
            async_waiting: VecDeque::new(),
            response_waits: HashMap::new(),
            pending_acks: VecDeque::new(),
            relay_frames: VecDeque::new(),
            next_packet_id: 0,
        }
    }

    /// Enqueue one outgoing message.
    pub fn push(
        &mut self,
        msg_id: MessageId,
        bundle: MessageBundle,
        protocol: &Protocol,
        completions: &mut Vec<WriteCompletion>,
    ) {
        let pending = PendingMessage { msg_id, bundle };
        if pending.bundle.flags.is_synchronous() {
            self.sync_waiting.push_back(pending);
        } else {
            self.async_waiting.push_back(pending);
        }
        self.promote_waiting(protocol, completions);
    }

    /// Queue a received packet id for piggybacked acknowledgment.
    pub fn queue_ack(&mut self, packet_id: u32) {
        self.pending_acks.push_back(packet_id);
    }

    /// Queue a relay frame for forwarding.
    pub fn push_relay_frame(&mut self, frame: RelayFrame) {
        self.relay_frames.push_back(frame);
    }

    /// Whether a call to [`produce_packet`](Self::produce_packet) could emit
    /// anything.
    pub fn has_work(&self) -> bool {
        !self.slots.is_empty()
            || !self.sync_waiting.is_empty()
            || !self.async_waiting.is_empty()
            || !self.pending_acks.is_empty()
            || !self.relay_frames.is_empty()
    }

    /// Messages held by this writer in any stage, the pool's load metric.
    pub fn load(&self) -> usize {
        self.slots.len() + self.sync_waiting.len() + self.async_waiting.len()
    }

    pub fn response_wait_count(&self) -> usize {
        self.response_waits.len()
    }

    /// Allocate the next packet id (also used for connection-level packets
    /// like KeepAlive and Connect, keeping ids strictly increasing per
    /// connection).
    pub fn allocate_packet_id(&mut self) -> u32 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        self.next_packet_id
    }

    /// Retrieve the request waiting on `request_id`, if any.
    pub fn take_response_wait(&mut self, request_id: u64) -> Option<ResponseWait> {
        self.response_waits.remove(&request_id)
    }

    /// Cancel `msg_id` wherever it currently lives. Idempotent; returns
    /// whether anything was found.
    pub fn cancel(&mut self, msg_id: MessageId, completions: &mut Vec<WriteCompletion>) -> bool {
        if let Some(pos) = self.sync_waiting.iter().position(|p| p.msg_id == msg_id) {
            let pending = self.sync_waiting.remove(pos).expect("position just found");
            Self::fail_pending(pending, Error::Canceled, completions);
            return true;
        }
        if let Some(pos) = self.async_waiting.iter().position(|p| p.msg_id == msg_id) {
            let pending = self.async_waiting.remove(pos).expect("position just found");
            Self::fail_pending(pending, Error::Canceled, completions);
            return true;
        }
        if let Some(pos) = self.slots.iter().position(|s| s.msg_id == msg_id) {
            if self.slots[pos].started {
                // Already on the wire: emit a cancel terminator so the peer
                // drops the partial message.
                self.slots[pos].canceled = true;
            } else {
                let slot = self.slots.remove(pos);
                if self.rr_cursor > pos {
                    self.rr_cursor -= 1;
                }
                if slot.is_sync {
                    self.sync_active = false;
                }
                completions.push(WriteCompletion::Failed {
                    msg_id: slot.msg_id,
                    type_id: slot.type_id,
                    message: Some(slot.message),
                    complete_fnc: slot.complete_fnc,
                    error: Error::Canceled,
                });
            }
            return true;
        }
        if let Some(wait) = self.response_waits.remove(&msg_id.to_request_id()) {
            completions.push(WriteCompletion::Failed {
                msg_id: wait.msg_id,
                type_id: wait.type_id,
                message: Some(wait.message),
                complete_fnc: wait.complete_fnc,
                error: Error::Canceled,
            });
            return true;
        }
        false
    }

    /// Produce the next ready packet, or `None` when there is nothing to
    /// send.
    pub fn produce_packet(
        &mut self,
        protocol: &Protocol,
        completions: &mut Vec<WriteCompletion>,
    ) -> Option<Packet> {
        self.promote_waiting(protocol, completions);

        let mut pkt = Packet::new(PacketType::Data, 0);
        let mut updates = Vec::new();
        while updates.len() < MAX_UPDATE_COUNT {
            match self.pending_acks.pop_front() {
                Some(id) => updates.push(id),
                None => break,
            }
        }
        if !updates.is_empty() {
            pkt.flags.set(crate::packet::PacketFlags::UPDATE);
            pkt.updates = updates;
        }

        // Relay frames first: they hold foreign buffers alive and their
        // packet carries a relay id, so they never mix with local fragments.
        if let Some(front) = self.relay_frames.front() {
            let relay_id = front.relay_id;
            pkt.set_relay(relay_id);
            while let Some(front) = self.relay_frames.front() {
                if front.relay_id != relay_id {
                    break;
                }
                let space = pkt.payload_capacity() - pkt.payload.len();
                if front.payload.len() > space {
                    // Frames are capped at RELAY_FRAME_MAX on creation, so
                    // only a non-empty packet can run out of room here.
                    debug_assert!(!pkt.payload.is_empty());
                    break;
                }
                let frame = self.relay_frames.pop_front().expect("front just checked");
                pkt.payload.extend_from_slice(&frame.payload);
            }
            return self.finish_packet(pkt);
        }

        loop {
            if self.slots.is_empty() {
                break;
            }
            let n = self.slots.len();
            let mut emitted_idx = None;
            let mut finished = false;
            for step in 0..n {
                let idx = (self.rr_cursor + step) % n;
                match Self::emit_fragment(&mut self.slots[idx], &mut pkt) {
                    FragOutcome::NoSpace => continue,
                    FragOutcome::Progress => {
                        emitted_idx = Some(idx);
                        break;
                    }
                    FragOutcome::Finished | FragOutcome::FinishedSilently => {
                        emitted_idx = Some(idx);
                        finished = true;
                        break;
                    }
                }
            }
            let Some(idx) = emitted_idx else { break };
            self.rr_cursor = (idx + 1) % n;
            if finished {
                let slot = self.slots.remove(idx);
                if self.rr_cursor > idx {
                    self.rr_cursor -= 1;
                }
                if slot.is_sync {
                    self.sync_active = false;
                }
                self.finish_slot(slot, completions);
                self.promote_waiting(protocol, completions);
            }
        }

        if pkt.payload.is_empty() {
            if pkt.updates.is_empty() {
                return None;
            }
            // Nothing to send but acks are pending: Update-only packet.
            pkt.packet_type = PacketType::Update;
        }
        self.finish_packet(pkt)
    }

    /// Fail everything the writer still holds; used during final drain.
    pub fn drain_all(&mut self, error: &Error, completions: &mut Vec<WriteCompletion>) {
        for pending in self
            .sync_waiting
            .drain(..)
            .chain(self.async_waiting.drain(..))
        {
            Self::fail_pending(pending, error.clone(), completions);
        }
        for slot in self.slots.drain(..) {
            completions.push(WriteCompletion::Failed {
                msg_id: slot.msg_id,
                type_id: slot.type_id,
                message: Some(slot.message),
                complete_fnc: slot.complete_fnc,
                error: error.clone(),
            });
        }
        for (_, wait) in self.response_waits.drain() {
            completions.push(WriteCompletion::Failed {
                msg_id: wait.msg_id,
                type_id: wait.type_id,
                message: Some(wait.message),
                complete_fnc: wait.complete_fnc,
                error: error.clone(),
            });
        }
        self.sync_active = false;
        self.relay_frames.clear();
        self.pending_acks.clear();
    }

    // -- internals ----------------------------------------------------------

    fn finish_packet(&mut self, mut pkt: Packet) -> Option<Packet> {
        pkt.packet_id = self.allocate_packet_id();
        trace!(
            packet_id = pkt.packet_id,
            ty = ?pkt.packet_type,
            len = pkt.buffer_size(),
            acks = pkt.updates.len(),
            "packet produced"
        );
        Some(pkt)
    }

    fn fail_pending(
        pending: PendingMessage,
        error: Error,
        completions: &mut Vec<WriteCompletion>,
    ) {
        completions.push(WriteCompletion::Failed {
            msg_id: pending.msg_id,
            type_id: pending.bundle.type_id,
            message: Some(pending.bundle.message),
            complete_fnc: pending.bundle.complete_fnc,
            error,
        });
    }

    fn promote_waiting(&mut self, protocol: &Protocol, completions: &mut Vec<WriteCompletion>) {
        // Synchronous lane: a single slot, strictly FIFO.
        while !self.sync_active
            && !self.sync_waiting.is_empty()
            && self.slots.len() < self.cfg.max_message_count_multiplex
            && self.response_capacity_for(self.sync_waiting.front().expect("checked non-empty"))
        {
            let pending = self.sync_waiting.pop_front().expect("checked non-empty");
            if self.admit(pending, protocol, completions) {
                self.sync_active = true;
            }
        }
        while !self.async_waiting.is_empty()
            && self.slots.len() < self.cfg.max_message_count_multiplex
        {
            if !self.response_capacity_for(self.async_waiting.front().expect("checked non-empty"))
            {
                break;
            }
            let pending = self.async_waiting.pop_front().expect("checked non-empty");
            self.admit(pending, protocol, completions);
        }
    }

    fn response_capacity_for(&self, pending: &PendingMessage) -> bool {
        if !pending.bundle.flags.awaits_response() {
            return true;
        }
        let awaiting_in_slots = self
            .slots
            .iter()
            .filter(|s| s.flags.awaits_response())
            .count();
        self.response_waits.len() + awaiting_in_slots < self.cfg.max_message_count_response_wait
    }

    /// Serialize and slot a pending message. Returns false when the message
    /// failed admission (the failure is already recorded).
    fn admit(
        &mut self,
        pending: PendingMessage,
        protocol: &Protocol,
        completions: &mut Vec<WriteCompletion>,
    ) -> bool {
        let PendingMessage { msg_id, bundle } = pending;
        let data = match protocol.serialize(bundle.type_id, &bundle.message) {
            Ok(data) => data,
            Err(err) => {
                completions.push(WriteCompletion::Failed {
                    msg_id,
                    type_id: bundle.type_id,
                    message: Some(bundle.message),
                    complete_fnc: bundle.complete_fnc,
                    error: err,
                });
                return false;
            }
        };
        if data.len() > self.cfg.max_message_size {
            completions.push(WriteCompletion::Failed {
                msg_id,
                type_id: bundle.type_id,
                message: Some(bundle.message),
                complete_fnc: bundle.complete_fnc,
                error: Error::TooLarge,
            });
            return false;
        }

        let mut flags = bundle.flags;
        if bundle.relay_name.is_some() {
            flags.set(MessageFlags::RELAYED);
        }
        let request_id = bundle
            .response_request_id
            .unwrap_or_else(|| msg_id.to_request_id());
        let is_sync = flags.is_synchronous();
        self.slots.push(WriteSlot {
            msg_id,
            request_id,
            type_id: bundle.type_id,
            flags,
            relay_name: bundle.relay_name,
            data,
            offset: 0,
            started: false,
            canceled: false,
            is_sync,
            message: bundle.message,
            complete_fnc: bundle.complete_fnc,
        });
        true
    }

    fn emit_fragment(slot: &mut WriteSlot, pkt: &mut Packet) -> FragOutcome {
        let space = pkt.payload_capacity() - pkt.payload.len();

        if slot.canceled {
            if !slot.started {
                return FragOutcome::FinishedSilently;
            }
            let mut flags = FragmentFlags::default();
            flags.set(FragmentFlags::CANCEL);
            let header = FragmentHeader {
                kind: FragmentKind::Continued,
                flags,
                request_id: slot.request_id,
                message: None,
            };
            if space < header.encoded_len() {
                return FragOutcome::NoSpace;
            }
            encode_fragment_header(&header, 0, &mut pkt.payload);
            return FragOutcome::Finished;
        }

        let remaining = slot.data.len() - slot.offset;
        let kind = if slot.started {
            FragmentKind::Continued
        } else if slot.flags.is_response() {
            FragmentKind::Old
        } else {
            FragmentKind::New
        };
        let mut header = FragmentHeader {
            kind,
            flags: FragmentFlags::default(),
            request_id: slot.request_id,
            message: (!slot.started).then(|| slot.wire_header()),
        };
        let overhead = header.encoded_len();
        // Require at least one data byte unless the message is empty.
        let min_needed = overhead + remaining.min(1);
        if space < min_needed {
            return FragOutcome::NoSpace;
        }
        let take = remaining.min(space - overhead);
        let last = take == remaining;
        if last {
            header.flags.set(FragmentFlags::LAST);
        }
        encode_fragment_header(&header, take as u16, &mut pkt.payload);
        pkt.payload
            .extend_from_slice(&slot.data[slot.offset..slot.offset + take]);
        slot.offset += take;
        slot.started = true;
        if last {
            FragOutcome::Finished
        } else {
            FragOutcome::Progress
        }
    }

    fn finish_slot(&mut self, slot: WriteSlot, completions: &mut Vec<WriteCompletion>) {
        if slot.canceled {
            completions.push(WriteCompletion::Failed {
                msg_id: slot.msg_id,
                type_id: slot.type_id,
                message: Some(slot.message),
                complete_fnc: slot.complete_fnc,
                error: Error::Canceled,
            });
        } else if slot.flags.awaits_response() {
            self.response_waits.insert(
                slot.request_id,
                ResponseWait {
                    msg_id: slot.msg_id,
                    type_id: slot.type_id,
                    message: slot.message,
                    complete_fnc: slot.complete_fnc,
                },
            );
        } else {
            completions.push(WriteCompletion::Sent {
                msg_id: slot.msg_id,
                type_id: slot.type_id,
                message: slot.message,
                complete_fnc: slot.complete_fnc,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_fragment;
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

    fn bundle(len: usize, flags: MessageFlags) -> MessageBundle {
        MessageBundle {
            message: Box::new(Payload {
                bytes: vec![0x5a; len],
            }),
            type_id: 1,
            flags,
            relay_name: None,
            response_request_id: None,
            complete_fnc: None,
        }
    }

    fn msg_id(index: u32) -> MessageId {
        MessageId { index, unique: 1 }
    }

    fn decode_fragments(pkt: &Packet) -> Vec<(FragmentHeader, Vec<u8>)> {
        let mut out = Vec::new();
        let mut at = 0;
        while at < pkt.payload.len() {
            let (header, data, used) = decode_fragment(&pkt.payload[at..]).unwrap();
            out.push((header, data.to_vec()));
            at += used;
        }
        out
    }

    #[test]
    fn small_message_fits_one_packet() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(64, MessageFlags::empty()), &proto, &mut completions);
        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        assert_eq!(pkt.packet_type, PacketType::Data);

        let frags = decode_fragments(&pkt);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].0.kind, FragmentKind::New);
        assert!(frags[0].0.flags.has(FragmentFlags::LAST));
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0], WriteCompletion::Sent { .. }));

        // Nothing left.
        assert!(writer.produce_packet(&proto, &mut completions).is_none());
    }

    #[test]
    fn large_message_spans_packets_in_order() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(
            msg_id(0),
            bundle(10_000, MessageFlags::empty()),
            &proto,
            &mut completions,
        );

        let mut total = 0;
        let mut packets = 0;
        let mut saw_last = false;
        while let Some(pkt) = writer.produce_packet(&proto, &mut completions) {
            packets += 1;
            for (header, data) in decode_fragments(&pkt) {
                if packets == 1 {
                    assert_ne!(header.kind, FragmentKind::Continued);
                }
                if header.flags.has(FragmentFlags::LAST) {
                    saw_last = true;
                }
                total += data.len();
            }
        }
        assert!(packets >= 3);
        assert!(saw_last);
        // Serialized body: 8-byte length prefix + payload.
        assert_eq!(total, 10_000 + 8);
    }

    #[test]
    fn async_messages_interleave() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(9_000, MessageFlags::empty()), &proto, &mut completions);
        writer.push(msg_id(1), bundle(9_000, MessageFlags::empty()), &proto, &mut completions);

        // Two multi-packet messages: both must appear before either ends.
        let pkt1 = writer.produce_packet(&proto, &mut completions).unwrap();
        let pkt2 = writer.produce_packet(&proto, &mut completions).unwrap();
        let ids1: Vec<u64> = decode_fragments(&pkt1).iter().map(|f| f.0.request_id).collect();
        let ids2: Vec<u64> = decode_fragments(&pkt2).iter().map(|f| f.0.request_id).collect();
        let mut seen = ids1;
        seen.extend(ids2);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 2, "both messages progress early");
    }

    #[test]
    fn synchronous_lane_is_strictly_sequential() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(9_000, MessageFlags::SYNCHRONOUS), &proto, &mut completions);
        writer.push(msg_id(1), bundle(64, MessageFlags::SYNCHRONOUS), &proto, &mut completions);

        let first_rid = msg_id(0).to_request_id();
        let second_rid = msg_id(1).to_request_id();
        let mut first_done = false;
        while let Some(pkt) = writer.produce_packet(&proto, &mut completions) {
            for (header, _) in decode_fragments(&pkt) {
                if header.request_id == second_rid {
                    assert!(first_done, "second sync message started before first ended");
                }
                if header.request_id == first_rid && header.flags.has(FragmentFlags::LAST) {
                    first_done = true;
                }
            }
        }
        assert!(first_done);
        assert_eq!(completions.len(), 2);
    }

    #[test]
    fn cancel_before_wire_is_silent() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(64, MessageFlags::empty()), &proto, &mut completions);
        assert!(writer.cancel(msg_id(0), &mut completions));
        assert!(matches!(
            completions[0],
            WriteCompletion::Failed {
                error: Error::Canceled,
                ..
            }
        ));
        assert!(writer.produce_packet(&proto, &mut completions).is_none());
    }

    #[test]
    fn cancel_mid_stream_emits_terminator() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(20_000, MessageFlags::empty()), &proto, &mut completions);
        // First fragment goes out.
        let _ = writer.produce_packet(&proto, &mut completions).unwrap();
        assert!(writer.cancel(msg_id(0), &mut completions));

        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        let frags = decode_fragments(&pkt);
        assert_eq!(frags.len(), 1);
        assert!(frags[0].0.flags.has(FragmentFlags::CANCEL));
        assert!(completions
            .iter()
            .any(|c| matches!(c, WriteCompletion::Failed { error: Error::Canceled, .. })));
        assert!(writer.produce_packet(&proto, &mut completions).is_none());
    }

    #[test]
    fn acks_piggyback_and_flush_alone() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.queue_ack(11);
        writer.queue_ack(12);
        writer.push(msg_id(0), bundle(16, MessageFlags::empty()), &proto, &mut completions);

        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        assert_eq!(pkt.packet_type, PacketType::Data);
        assert_eq!(pkt.updates, vec![11, 12]);

        // Acks with no data flush as an Update-only packet.
        writer.queue_ack(13);
        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        assert_eq!(pkt.packet_type, PacketType::Update);
        assert_eq!(pkt.updates, vec![13]);
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn oversized_message_fails_and_writer_continues() {
        let proto = proto();
        let mut cfg = WriterConfiguration::default();
        cfg.max_message_size = 1024;
        let mut writer = MessageWriter::new(cfg);
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(2048, MessageFlags::empty()), &proto, &mut completions);
        writer.push(msg_id(1), bundle(128, MessageFlags::empty()), &proto, &mut completions);

        assert!(matches!(
            completions[0],
            WriteCompletion::Failed {
                error: Error::TooLarge,
                ..
            }
        ));
        // The small one still goes out.
        assert!(writer.produce_packet(&proto, &mut completions).is_some());
    }

    #[test]
    fn boundary_sizes_around_the_cap() {
        let proto = proto();
        let mut cfg = WriterConfiguration::default();
        // Serialized form of Payload is an 8-byte length prefix + bytes.
        cfg.max_message_size = 1000 + 8;
        let mut writer = MessageWriter::new(cfg);
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(1000, MessageFlags::empty()), &proto, &mut completions);
        assert!(completions.is_empty(), "message at the cap must pass");

        writer.push(msg_id(1), bundle(1001, MessageFlags::empty()), &proto, &mut completions);
        assert!(matches!(
            completions[0],
            WriteCompletion::Failed {
                error: Error::TooLarge,
                ..
            }
        ));
    }

    #[test]
    fn awaiting_request_parks_in_response_waits() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(
            msg_id(0),
            bundle(64, MessageFlags::AWAIT_RESPONSE),
            &proto,
            &mut completions,
        );
        let _ = writer.produce_packet(&proto, &mut completions).unwrap();
        assert!(completions.is_empty(), "no completion until the response");
        assert_eq!(writer.response_wait_count(), 1);

        let wait = writer.take_response_wait(msg_id(0).to_request_id()).unwrap();
        assert_eq!(wait.msg_id, msg_id(0));
    }

    #[test]
    fn response_uses_old_kind_and_request_id() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        let mut b = bundle(32, MessageFlags::RESPONSE);
        b.response_request_id = Some(0x77);
        writer.push(msg_id(5), b, &proto, &mut completions);

        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        let frags = decode_fragments(&pkt);
        assert_eq!(frags[0].0.kind, FragmentKind::Old);
        assert_eq!(frags[0].0.request_id, 0x77);
        let header = frags[0].0.message.as_ref().unwrap();
        assert!(header.flags.is_response());
    }

    #[test]
    fn drain_fails_everything_once() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(64, MessageFlags::empty()), &proto, &mut completions);
        writer.push(
            msg_id(1),
            bundle(64, MessageFlags::AWAIT_RESPONSE),
            &proto,
            &mut completions,
        );
        // Flush the awaiting request onto the wire so it parks.
        while writer.produce_packet(&proto, &mut completions).is_some() {}
        let sent: usize = completions
            .iter()
            .filter(|c| matches!(c, WriteCompletion::Sent { .. }))
            .count();
        assert_eq!(sent, 1);

        completions.clear();
        writer.drain_all(&Error::ConnectionClosed, &mut completions);
        assert_eq!(completions.len(), 1, "only the parked request remains");
        assert!(matches!(
            completions[0],
            WriteCompletion::Failed {
                error: Error::ConnectionClosed,
                ..
            }
        ));
    }

    #[test]
    fn relay_frames_take_priority_and_carry_relay_id() {
        let proto = proto();
        let mut writer = MessageWriter::new(WriterConfiguration::default());
        let mut completions = Vec::new();

        writer.push(msg_id(0), bundle(64, MessageFlags::empty()), &proto, &mut completions);
        writer.push_relay_frame(RelayFrame {
            relay_id: 9,
            payload: Arc::new(vec![1, 2, 3]),
        });

        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        assert!(pkt.relay.is_some());
        assert_eq!(pkt.relay.unwrap().relay_id, 9);
        assert_eq!(pkt.payload, vec![1, 2, 3]);

        // The local message follows in the next packet.
        let pkt = writer.produce_packet(&proto, &mut completions).unwrap();
        assert!(pkt.relay.is_none());
    }
}
