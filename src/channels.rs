//! Channel records and the per-connection channel set.
//!
//! A channel is pending from the moment an initiator half is chosen until the
//! handshake completes, then established with a record holding its buffers.
//! The pending set holds partial ids only; the established map holds full
//! ids. An id never appears in both.

use crate::identity::{Capabilities, ChannelId, DEFAULT_CHANNELID};
use crate::logging::{self, Logger};
use crate::message::Message;
use crate::packet::Packet;
use crate::pool::Slot;
use crate::support::{Error, ErrorKind, ProtocolResult};
use crate::sync::{LockCell, LockStrategy};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::collections::VecDeque;
use std::sync::Arc;

/// One message payload retained for a user read: a span into a packet
/// payload, kept alive by the slot reference.
#[derive(Clone, Debug)]
pub struct DataSpan {
    pub slot: Slot,
    pub offset: usize,
    pub length: usize,
}

impl DataSpan {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.slot.data()[self.offset..self.offset + self.length]
    }
}

/// Per-channel state: ingress payloads awaiting user reads, egress messages
/// awaiting bundling, and bundled packets awaiting the transport.
#[derive(Debug)]
pub struct ChannelRecord {
    id: ChannelId,
    capabilities: Capabilities,
    egress_sequence: u16,
    ingress: VecDeque<DataSpan>,
    egress_messages: VecDeque<Message>,
    egress_packets: VecDeque<Packet>,
}

impl ChannelRecord {
    #[inline]
    fn new(id: ChannelId) -> ChannelRecord {
        ChannelRecord {
            id,
            capabilities: Capabilities::empty(),
            egress_sequence: 0,
            ingress: VecDeque::new(),
            egress_messages: VecDeque::new(),
            egress_packets: VecDeque::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[inline]
    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// Next egress sequence number; monotonic per channel, wraps.
    #[inline]
    pub fn next_sequence(&mut self) -> u16 {
        let sequence = self.egress_sequence;
        self.egress_sequence = self.egress_sequence.wrapping_add(1);
        sequence
    }

    #[inline]
    pub fn push_ingress(&mut self, span: DataSpan) {
        self.ingress.push_back(span);
    }

    /// Requeue a span at the front, used when a user read buffer was too
    /// small and the payload must stay available.
    #[inline]
    pub fn push_ingress_front(&mut self, span: DataSpan) {
        self.ingress.push_front(span);
    }

    #[inline]
    pub fn pop_ingress(&mut self) -> Option<DataSpan> {
        self.ingress.pop_front()
    }

    #[inline]
    pub fn ingress_len(&self) -> usize {
        self.ingress.len()
    }

    #[inline]
    pub fn enqueue_message(&mut self, message: Message) {
        self.egress_messages.push_back(message);
    }

    #[inline]
    pub fn front_message_size(&self) -> Option<usize> {
        self.egress_messages.front().map(Message::encoded_size)
    }

    #[inline]
    pub fn pop_message(&mut self) -> Option<Message> {
        self.egress_messages.pop_front()
    }

    #[inline]
    pub fn has_queued_messages(&self) -> bool {
        !self.egress_messages.is_empty()
    }

    #[inline]
    pub fn push_packet(&mut self, packet: Packet) {
        self.egress_packets.push_back(packet);
    }

    #[inline]
    pub fn pop_packet(&mut self) -> Option<Packet> {
        self.egress_packets.pop_front()
    }

    #[inline]
    pub fn egress_packet_count(&self) -> usize {
        self.egress_packets.len()
    }
}

/// Shared handle to a channel record. Pipelines, state machines and user
/// reads all hold clones; the record lives as long as its longest holder.
pub type ChannelRef = Arc<LockCell<ChannelRecord>>;

/// Pending partial ids plus established records for one connection, along
/// with the always-present handshake channel record.
pub struct ChannelSet {
    strategy: LockStrategy,
    default_record: ChannelRef,
    pending: IndexSet<ChannelId>,
    established: HashMap<ChannelId, ChannelRef>,
    log: Logger,
}

impl ChannelSet {
    const COMPLETE_ATTEMPTS: usize = 64;

    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(strategy: LockStrategy, log: L) -> ChannelSet {
        ChannelSet {
            strategy,
            default_record: Arc::new(LockCell::new(
                ChannelRecord::new(DEFAULT_CHANNELID),
                strategy,
            )),
            pending: IndexSet::new(),
            established: HashMap::new(),
            log: logging::child(log),
        }
    }

    /// The reserved handshake channel record.
    #[inline]
    pub fn default_channel(&self) -> ChannelRef {
        self.default_record.clone()
    }

    /// Register an id. Complete ids get (or keep) a record; partial-initiator
    /// ids join the pending set. Both are idempotent. Anything else is
    /// invalid.
    pub fn add(&mut self, id: ChannelId) -> ProtocolResult<Option<ChannelRef>> {
        if id.is_complete() {
            let strategy = self.strategy;
            let record = self
                .established
                .entry(id)
                .or_insert_with(|| Arc::new(LockCell::new(ChannelRecord::new(id), strategy)));

            return Ok(Some(record.clone()));
        }

        if id.is_partial_initiator() {
            self.pending.insert(id);
            return Ok(None);
        }

        Err(Error::new(
            ErrorKind::InvalidChannelId,
            format!("channel id {} cannot be registered", id),
        ))
    }

    /// Promote a pending partial to an established full id, creating the
    /// record. Idempotent; the matching partial (if any) leaves the pending
    /// set.
    pub fn make_full(&mut self, id: ChannelId) -> ProtocolResult<ChannelRef> {
        if !id.is_complete() {
            return Err(Error::new(
                ErrorKind::InvalidChannelId,
                format!("channel id {} is not complete", id),
            ));
        }

        self.pending.shift_remove(&id.create_partial());

        let strategy = self.strategy;
        let record = self
            .established
            .entry(id)
            .or_insert_with(|| Arc::new(LockCell::new(ChannelRecord::new(id), strategy)));

        logging::debug!(self.log, "channel established"; "context" => "make_full", "channel" => %id);

        Ok(record.clone())
    }

    /// Choose a fresh partial-initiator id, absent from both sets, and insert
    /// it into the pending set.
    pub fn new_pending_channel(&mut self) -> ChannelId {
        loop {
            let half = rand::random::<u16>();
            if half == 0 {
                continue;
            }

            let id = ChannelId::new(half, 0);
            if self.pending.contains(&id) || self.initiator_half_established(half) {
                continue;
            }

            self.pending.insert(id);

            logging::debug!(self.log, "pending channel created";
                            "context" => "new_pending_channel",
                            "channel" => %id);

            return id;
        }
    }

    /// Fill in an unused responder half for the supplied partial id. The
    /// result collides with neither the pending set nor the established map.
    pub fn complete_channelid(&self, id: ChannelId) -> ProtocolResult<ChannelId> {
        if !id.is_partial_initiator() {
            return Err(Error::new(
                ErrorKind::InvalidChannelId,
                format!("channel id {} is not a partial initiator", id),
            ));
        }

        for _ in 0..Self::COMPLETE_ATTEMPTS {
            let half = rand::random::<u16>();
            if half == 0 {
                continue;
            }

            let full = id.make_full(half);
            if !self.established.contains_key(&full) && !self.pending.contains(&full) {
                return Ok(full);
            }
        }

        // Random attempts exhausted; sweep the space so the failure is
        // deterministic.
        for half in 1..=u16::max_value() {
            let full = id.make_full(half);
            if !self.established.contains_key(&full) && !self.pending.contains(&full) {
                return Ok(full);
            }
        }

        Err(Error::new(
            ErrorKind::InvalidChannelId,
            format!("no responder half left for {}", id),
        ))
    }

    #[inline]
    pub fn has_channel(&self, id: ChannelId) -> bool {
        self.has_pending_channel(id) || self.has_established_channel(id)
    }

    #[inline]
    pub fn has_pending_channel(&self, id: ChannelId) -> bool {
        self.pending.contains(&id)
    }

    #[inline]
    pub fn has_established_channel(&self, id: ChannelId) -> bool {
        self.established.contains_key(&id)
    }

    /// The record for an established id.
    #[inline]
    pub fn get(&self, id: ChannelId) -> Option<ChannelRef> {
        self.established.get(&id).cloned()
    }

    /// Like `get`, but the empty id resolves to the handshake channel record.
    #[inline]
    pub fn lookup(&self, id: ChannelId) -> Option<ChannelRef> {
        if id.is_empty() {
            Some(self.default_record.clone())
        } else {
            self.get(id)
        }
    }

    /// Remove an id from whichever set holds it.
    pub fn remove(&mut self, id: ChannelId) -> bool {
        let removed = if id.is_complete() {
            self.established.remove(&id).is_some()
        } else {
            self.pending.shift_remove(&id)
        };

        if removed {
            logging::debug!(self.log, "channel removed"; "context" => "remove", "channel" => %id);
        }

        removed
    }

    #[inline]
    pub fn drop_pending_channel(&mut self, id: ChannelId) -> bool {
        self.pending.shift_remove(&id)
    }

    /// The established full id whose initiator half matches the supplied
    /// partial, if any.
    pub fn get_established_id(&self, partial: ChannelId) -> Option<ChannelId> {
        let half = partial.initiator();

        self.established
            .keys()
            .find(|id| id.initiator() == half)
            .copied()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn established_count(&self) -> usize {
        self.established.len()
    }

    #[inline]
    pub fn established_ids(&self) -> Vec<ChannelId> {
        self.established.keys().copied().collect()
    }

    #[inline]
    fn initiator_half_established(&self, half: u16) -> bool {
        self.established.keys().any(|id| id.initiator() == half)
    }
}
