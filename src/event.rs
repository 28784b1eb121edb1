//! Events and actions traversing the filter pipelines.
//!
//! Events flow forward through pipeline stages; actions flow backward as a
//! returned collection. A single tagged union covers every pipeline; each
//! stage documents which variants it accepts.

use crate::channels::{ChannelRef, DataSpan};
use crate::identity::{ChannelId, PeerId};
use crate::message::Message;
use crate::packet::{Header, Packet};
use crate::pool::Slot;
use crate::support::Error;
use crate::timeout::ScopedTag;
use std::fmt;

/// Opaque transport endpoint handle assigned by the host (a socket index,
/// file descriptor, whatever the substrate uses).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct TransportAddr(pub u64);

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transport:{}", self.0)
    }
}

/// Coarse routing class for events leaving a pipeline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventCategory {
    /// Consumed inside the ingress pipeline.
    Ingress,
    /// Destined for the egress pipeline.
    Egress,
    /// Destined for the user notification path.
    User,
}

pub enum Event {
    /// Raw inbound buffer handed over by the transport.
    PacketReceived {
        src: TransportAddr,
        dst: TransportAddr,
        slot: Slot,
    },
    /// Public header parsed; buffer not yet validated.
    HeaderParsed {
        src: TransportAddr,
        dst: TransportAddr,
        slot: Slot,
        header: Header,
    },
    /// Past the ban lists, wrapped as a packet view.
    PacketRouted {
        src: TransportAddr,
        dst: TransportAddr,
        packet: Packet,
    },
    /// Checksum verified (and, once encryption lands, decrypted).
    PacketValidated {
        src: TransportAddr,
        dst: TransportAddr,
        packet: Packet,
    },
    /// Channel resolved. `channel` is `None` for packets on a pending
    /// channel, which later stages treat as early traffic.
    PacketAssigned {
        src: TransportAddr,
        dst: TransportAddr,
        packet: Packet,
        channel: Option<ChannelRef>,
    },
    /// One parsed message out of a packet payload.
    MessageReceived {
        src: TransportAddr,
        dst: TransportAddr,
        packet: Packet,
        channel: Option<ChannelRef>,
        message: Message,
    },
    /// User asked for a new channel to the connection's peer.
    NewChannel { peer: PeerId },
    /// A timeout expired and was re-injected.
    Timeout { tag: ScopedTag },
    /// User handed bytes to a channel.
    UserDataWritten { channel: ChannelId, data: Vec<u8> },
    /// A DATA payload is ready for a user read.
    UserDataToRead { channel: ChannelId, span: DataSpan },
    /// An established channel has queued egress messages to flush.
    UserDataToSend { channel: ChannelId },
    /// A message bound for the peer.
    MessageOut { channel: ChannelId, message: Message },
    /// The message joined the channel's egress queue.
    MessageOutEnqueued { channel: ChannelId },
    /// A bundled outbound packet.
    PacketOut { packet: Packet },
    /// The packet joined the channel's egress buffer.
    PacketOutEnqueued { channel: ChannelId },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PacketReceived { .. } => "PACKET_RECEIVED",
            Event::HeaderParsed { .. } => "HEADER_PARSED",
            Event::PacketRouted { .. } => "PACKET_ROUTED",
            Event::PacketValidated { .. } => "PACKET_VALIDATED",
            Event::PacketAssigned { .. } => "PACKET_ASSIGNED",
            Event::MessageReceived { .. } => "MESSAGE_RECEIVED",
            Event::NewChannel { .. } => "NEW_CHANNEL",
            Event::Timeout { .. } => "TIMEOUT",
            Event::UserDataWritten { .. } => "USER_DATA_WRITTEN",
            Event::UserDataToRead { .. } => "USER_DATA_TO_READ",
            Event::UserDataToSend { .. } => "USER_DATA_TO_SEND",
            Event::MessageOut { .. } => "MESSAGE_OUT",
            Event::MessageOutEnqueued { .. } => "MESSAGE_OUT_ENQUEUED",
            Event::PacketOut { .. } => "PACKET_OUT",
            Event::PacketOutEnqueued { .. } => "PACKET_OUT_ENQUEUED",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Event::UserDataToSend { .. }
            | Event::MessageOut { .. }
            | Event::MessageOutEnqueued { .. }
            | Event::PacketOut { .. }
            | Event::PacketOutEnqueued { .. } => EventCategory::Egress,
            Event::UserDataToRead { .. } => EventCategory::User,
            _ => EventCategory::Ingress,
        }
    }
}

// Channel references render poorly, so events print as their kind name.
impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backward-flowing pipeline results.
#[derive(Clone, Debug)]
pub enum Action {
    /// Placeholder for classifier results with no decision.
    Unknown,
    /// Ban a transport endpoint.
    FilterTransport(TransportAddr),
    /// Ban a peer id.
    FilterPeer(PeerId),
    /// A channel finished its handshake.
    NotifyChannelEstablished(ChannelId),
    /// A failure to surface to the caller.
    Error(Error),
}
