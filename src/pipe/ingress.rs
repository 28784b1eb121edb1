//! Ingress pipeline: de-envelope → route → validate → channel-assign →
//! message-parse → state-handling.
//!
//! Malformed traffic drops quietly along the way, optionally leaving filter
//! actions behind so repeat offenders get banned at the route stage.

use crate::config::Config;
use crate::connection::ConnectionContext;
use crate::event::{Action, Event, TransportAddr};
use crate::fsm::FsmRegistry;
use crate::identity::PeerId;
use crate::logging::{self, Logger};
use crate::packet::{self, Packet};
use crate::pipe::{Pipe, Stage};
use crate::policy::{FilterPolicy, ThresholdPolicy};
use crate::support::{Error, ErrorKind, ProtocolResult};
use hashbrown::HashSet;

/// Build the standard ingress pipe for one connection.
pub fn ingress_pipe(config: &Config, log: &Logger) -> Pipe {
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(DecodeStage::new(log)),
        Box::new(RouteStage::new(log)),
        Box::new(ValidateStage::new(
            Box::new(ThresholdPolicy::new(config.peer_failure_limit)),
            Box::new(ThresholdPolicy::new(config.transport_failure_limit)),
            log,
        )),
        Box::new(ChannelStage::new(
            Box::new(ThresholdPolicy::new(config.peer_failure_limit)),
            log,
        )),
        Box::new(MessageStage::new(log)),
        Box::new(StateStage::new(log)),
    ];

    Pipe::new(stages, log)
}

/// Parses the public header off the raw buffer. Malformed headers drop the
/// event silently; a degenerate buffer is a programming fault.
pub struct DecodeStage {
    log: Logger,
}

impl DecodeStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> DecodeStage {
        DecodeStage {
            log: logging::child(log),
        }
    }
}

impl Stage for DecodeStage {
    fn name(&self) -> &'static str {
        "de-envelope"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketReceived { .. })
    }

    fn process(
        &mut self,
        _ctx: &mut ConnectionContext,
        event: Event,
        _actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let (src, dst, slot) = match event {
            Event::PacketReceived { src, dst, slot } => (src, dst, slot),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("de-envelope cannot consume {}", other.name()),
                ));
            }
        };

        if slot.capacity() == 0 {
            return Err(Error::new(
                ErrorKind::InvalidReference,
                "empty buffer handed to the ingress pipe",
            ));
        }

        match packet::parse_header(slot.data()) {
            Ok(header) => events.push(Event::HeaderParsed {
                src,
                dst,
                slot,
                header,
            }),
            Err(error) => {
                logging::debug!(self.log, "malformed header dropped";
                                "context" => "de_envelope",
                                "error" => %error);
            }
        }

        Ok(())
    }
}

/// Applies the peer and transport ban lists and wraps the slot as a packet.
/// The lists are populated by FILTER actions flowing back from later stages.
pub struct RouteStage {
    banned_peers: HashSet<PeerId>,
    banned_transports: HashSet<TransportAddr>,
    log: Logger,
}

impl RouteStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> RouteStage {
        RouteStage {
            banned_peers: HashSet::new(),
            banned_transports: HashSet::new(),
            log: logging::child(log),
        }
    }
}

impl Stage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::HeaderParsed { .. })
    }

    fn process(
        &mut self,
        _ctx: &mut ConnectionContext,
        event: Event,
        _actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let (src, dst, slot, header) = match event {
            Event::HeaderParsed {
                src,
                dst,
                slot,
                header,
            } => (src, dst, slot, header),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("route cannot consume {}", other.name()),
                ));
            }
        };

        if self.banned_peers.contains(&header.sender)
            || self.banned_peers.contains(&header.recipient)
        {
            logging::debug!(self.log, "packet from banned peer dropped";
                            "context" => "route",
                            "sender" => %header.sender);
            return Ok(());
        }

        if self.banned_transports.contains(&src) {
            logging::debug!(self.log, "packet from banned transport dropped";
                            "context" => "route",
                            "transport" => %src);
            return Ok(());
        }

        match Packet::parse(slot) {
            Ok(packet) => events.push(Event::PacketRouted { src, dst, packet }),
            Err(error) => {
                logging::debug!(self.log, "malformed packet dropped";
                                "context" => "route",
                                "error" => %error);
            }
        }

        Ok(())
    }

    fn observe(&mut self, action: &Action) {
        match action {
            Action::FilterPeer(peer) => {
                logging::debug!(self.log, "peer banned"; "context" => "route", "peer" => %peer);
                self.banned_peers.insert(*peer);
            }
            Action::FilterTransport(transport) => {
                logging::debug!(self.log, "transport banned";
                                "context" => "route",
                                "transport" => %transport);
                self.banned_transports.insert(*transport);
            }
            _ => (),
        }
    }
}

/// Verifies the checksum. Failures consult the peer and transport failure
/// policies, which may request bans. Decryption will slot in here once the
/// ENCRYPTED flag is honoured.
pub struct ValidateStage {
    peer_policy: Box<dyn FilterPolicy<PeerId>>,
    transport_policy: Box<dyn FilterPolicy<TransportAddr>>,
    log: Logger,
}

impl ValidateStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        peer_policy: Box<dyn FilterPolicy<PeerId>>,
        transport_policy: Box<dyn FilterPolicy<TransportAddr>>,
        log: L,
    ) -> ValidateStage {
        ValidateStage {
            peer_policy,
            transport_policy,
            log: logging::child(log),
        }
    }
}

impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketRouted { .. })
    }

    fn process(
        &mut self,
        _ctx: &mut ConnectionContext,
        event: Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let (src, dst, packet) = match event {
            Event::PacketRouted { src, dst, packet } => (src, dst, packet),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("validate cannot consume {}", other.name()),
                ));
            }
        };

        if packet.has_valid_checksum() {
            events.push(Event::PacketValidated { src, dst, packet });
            return Ok(());
        }

        logging::debug!(self.log, "checksum mismatch dropped";
                        "context" => "validate",
                        "sender" => %packet.sender());

        if self.peer_policy.register_failure(&packet.sender()) {
            actions.push(Action::FilterPeer(packet.sender()));
        }
        if self.transport_policy.register_failure(&src) {
            actions.push(Action::FilterTransport(src));
        }

        Ok(())
    }
}

/// Resolves the packet's channel: the handshake record for the empty id, the
/// record for established ids, a null reference for pending ones. Unknown
/// channels drop and feed the classifier.
pub struct ChannelStage {
    classifier: Box<dyn FilterPolicy<PeerId>>,
    log: Logger,
}

impl ChannelStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        classifier: Box<dyn FilterPolicy<PeerId>>,
        log: L,
    ) -> ChannelStage {
        ChannelStage {
            classifier,
            log: logging::child(log),
        }
    }
}

impl Stage for ChannelStage {
    fn name(&self) -> &'static str {
        "channel-assign"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketValidated { .. })
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let (src, dst, packet) = match event {
            Event::PacketValidated { src, dst, packet } => (src, dst, packet),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("channel-assign cannot consume {}", other.name()),
                ));
            }
        };

        let id = packet.channel();

        let channel = if id.is_empty() {
            Some(ctx.channels.default_channel())
        } else if let Some(record) = ctx.channels.get(id) {
            Some(record)
        } else if ctx.channels.has_pending_channel(id)
            || ctx.channels.has_pending_channel(id.create_partial())
        {
            // Early traffic on a half-open channel; later stages decide.
            None
        } else {
            logging::debug!(self.log, "packet on unknown channel dropped";
                            "context" => "channel_assign",
                            "channel" => %id,
                            "sender" => %packet.sender());

            if self.classifier.register_failure(&packet.sender()) {
                actions.push(Action::FilterPeer(packet.sender()));
            }

            return Ok(());
        };

        events.push(Event::PacketAssigned {
            src,
            dst,
            packet,
            channel,
        });

        Ok(())
    }
}

/// Splits a packet payload into per-message events. The undecodable tail
/// (the padding) is skipped silently by the message iterator.
pub struct MessageStage {
    log: Logger,
}

impl MessageStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> MessageStage {
        MessageStage {
            log: logging::child(log),
        }
    }
}

impl Stage for MessageStage {
    fn name(&self) -> &'static str {
        "message-parse"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketAssigned { .. })
    }

    fn process(
        &mut self,
        _ctx: &mut ConnectionContext,
        event: Event,
        _actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let (src, dst, packet, channel) = match event {
            Event::PacketAssigned {
                src,
                dst,
                packet,
                channel,
            } => (src, dst, packet, channel),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("message-parse cannot consume {}", other.name()),
                ));
            }
        };

        let messages: Vec<_> = packet.messages().collect();

        logging::trace!(self.log, "messages parsed";
                        "context" => "message_parse",
                        "channel" => %packet.channel(),
                        "count" => messages.len());

        for message in messages {
            events.push(Event::MessageReceived {
                src,
                dst,
                packet: packet.clone(),
                channel: channel.clone(),
                message,
            });
        }

        Ok(())
    }
}

/// Terminal stage: hands message, timeout and user events to the state
/// machine registry and forwards whatever the machines emit. Result events
/// leave the pipe and are routed by category at the connection.
pub struct StateStage {
    registry: FsmRegistry,
    log: Logger,
}

impl StateStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> StateStage {
        let log = logging::child(log);

        StateStage {
            registry: FsmRegistry::new(&log),
            log,
        }
    }
}

impl Stage for StateStage {
    fn name(&self) -> &'static str {
        "state-handling"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(
            event,
            Event::MessageReceived { .. }
                | Event::NewChannel { .. }
                | Event::Timeout { .. }
                | Event::UserDataWritten { .. }
        )
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        if !self.registry.process(ctx, &event, actions, events) {
            // A wedged machine set is logged and the event dropped; the
            // transport must not crash over it.
            logging::warn!(self.log, "event dropped by the state machines";
                           "context" => "state_handling",
                           "event" => event.name());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionContext, NodeContext};
    use crate::event::Event;
    use crate::identity::{ChannelId, DEFAULT_CHANNELID};
    use crate::packet::PAYLOAD_OFFSET;
    use crate::sync::LockStrategy;

    const SRC: TransportAddr = TransportAddr(7);
    const DST: TransportAddr = TransportAddr(8);

    fn context(config: &Config) -> ConnectionContext {
        let node = NodeContext::with_peer_id(
            PeerId::new([2; 16]),
            config.clone(),
            Box::new(|| b"s".to_vec()),
            LockStrategy::SingleThread,
            None,
        );

        ConnectionContext::new(
            &node,
            PeerId::new([1; 16]),
            Box::new(|duration| duration),
            &crate::logging::null(),
        )
    }

    fn config_with_limit(limit: u32) -> Config {
        Config {
            packet_size: 128,
            block_capacity: 4,
            peer_failure_limit: limit,
            transport_failure_limit: limit,
            ..Config::default()
        }
    }

    /// An empty packet from the given sender, checksummed and optionally
    /// corrupted afterwards.
    fn packet_event(ctx: &ConnectionContext, sender: u8, channel: ChannelId, corrupt: bool) -> Event {
        let mut packet = Packet::prepare(ctx.pool.allocate().unwrap()).unwrap();

        packet.set_sender(&PeerId::new([sender; 16]));
        packet.set_recipient(&PeerId::new([2; 16]));
        packet.set_channel(channel);
        packet.set_sequence(0);
        packet.set_payload_size(0).unwrap();
        packet.write_padding();
        packet.write_checksum();

        let mut slot = packet.into_slot();
        if corrupt {
            slot.data_mut()[PAYLOAD_OFFSET] ^= 1;
        }

        Event::PacketReceived {
            src: SRC,
            dst: DST,
            slot,
        }
    }

    #[test]
    fn test_checksum_failure_requests_ban() {
        let config = config_with_limit(1);
        let mut ctx = context(&config);
        let mut pipe = ingress_pipe(&config, &crate::logging::null());

        let event = packet_event(&ctx, 9, DEFAULT_CHANNELID, true);
        let output = pipe.process(&mut ctx, event).unwrap();

        let banned = output.actions.iter().any(|action| {
            matches!(action, Action::FilterPeer(peer) if *peer == PeerId::new([9; 16]))
        });
        assert!(banned);
    }

    #[test]
    fn test_banned_peer_drops_before_validate() {
        let config = config_with_limit(1);
        let mut ctx = context(&config);
        let mut pipe = ingress_pipe(&config, &crate::logging::null());

        // First corrupted packet trips the policy and bans the sender.
        let event = packet_event(&ctx, 9, DEFAULT_CHANNELID, true);
        let output = pipe.process(&mut ctx, event).unwrap();
        assert!(!output.actions.is_empty());

        // The second one drops at the route stage: had it reached validate,
        // the policy would have fired again.
        let event = packet_event(&ctx, 9, DEFAULT_CHANNELID, true);
        let output = pipe.process(&mut ctx, event).unwrap();
        assert!(output.actions.is_empty());

        // Even a pristine packet from that sender is gone.
        let event = packet_event(&ctx, 9, DEFAULT_CHANNELID, false);
        let output = pipe.process(&mut ctx, event).unwrap();
        assert!(output.actions.is_empty());
        assert!(output.events.is_empty());
    }

    #[test]
    fn test_unknown_channel_feeds_classifier() {
        let config = config_with_limit(1);
        let mut ctx = context(&config);
        let mut pipe = ingress_pipe(&config, &crate::logging::null());

        let event = packet_event(&ctx, 9, ChannelId::new(0x1111, 0x2222), false);
        let output = pipe.process(&mut ctx, event).unwrap();

        let banned = output.actions.iter().any(|action| {
            matches!(action, Action::FilterPeer(peer) if *peer == PeerId::new([9; 16]))
        });
        assert!(banned);
    }

    #[test]
    fn test_pending_channel_passes_null_reference() {
        let config = config_with_limit(3);
        let mut ctx = context(&config);
        let mut pipe = ingress_pipe(&config, &crate::logging::null());

        // The initiator half is pending; early responder traffic on the full
        // id flows through with a null channel reference and the data machine
        // drops the payload quietly.
        let partial = ChannelId::new(0xa1a1, 0);
        ctx.channels.add(partial).unwrap();

        let event = packet_event(&ctx, 9, partial.make_full(0xb2b2), false);
        let output = pipe.process(&mut ctx, event).unwrap();

        assert!(output.actions.is_empty());
    }

    #[test]
    fn test_unacceptable_entry_event_is_loud() {
        let config = config_with_limit(3);
        let mut ctx = context(&config);
        let mut pipe = ingress_pipe(&config, &crate::logging::null());

        let result = pipe.process(
            &mut ctx,
            Event::PacketOutEnqueued {
                channel: DEFAULT_CHANNELID,
            },
        );

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidPipeEvent);
    }

    #[test]
    fn test_malformed_header_drops_quietly() {
        let config = config_with_limit(3);
        let mut ctx = context(&config);
        let mut pipe = ingress_pipe(&config, &crate::logging::null());

        // A buffer of zeroes has the wrong protocol id.
        let slot = ctx.pool.allocate().unwrap();
        let output = pipe
            .process(
                &mut ctx,
                Event::PacketReceived {
                    src: SRC,
                    dst: DST,
                    slot,
                },
            )
            .unwrap();

        assert!(output.actions.is_empty());
        assert!(output.events.is_empty());
    }
}
