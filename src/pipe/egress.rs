//! Egress pipeline: enqueue-message → message-bundling → add-checksum →
//! out-buffer → callback.

use crate::connection::{Callbacks, ConnectionContext};
use crate::event::{Action, Event};
use crate::logging::{self, Logger};
use crate::packet::Packet;
use crate::pipe::{Pipe, Stage};
use crate::support::{Error, ErrorKind, ProtocolResult};
use std::rc::Rc;

/// Build the standard egress pipe for one connection.
pub fn egress_pipe(callbacks: Rc<Callbacks>, log: &Logger) -> Pipe {
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(EnqueueStage::new(log)),
        Box::new(BundleStage::new(log)),
        Box::new(ChecksumStage::new(log)),
        Box::new(OutBufferStage::new(log)),
        Box::new(CallbackStage::new(callbacks, log)),
    ];

    Pipe::new(stages, log)
}

/// Appends an outbound message to its channel's egress queue.
pub struct EnqueueStage {
    log: Logger,
}

impl EnqueueStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> EnqueueStage {
        EnqueueStage {
            log: logging::child(log),
        }
    }
}

impl Stage for EnqueueStage {
    fn name(&self) -> &'static str {
        "enqueue-message"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::MessageOut { .. })
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let (channel, message) = match event {
            Event::MessageOut { channel, message } => (channel, message),
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("enqueue-message cannot consume {}", other.name()),
                ));
            }
        };

        let record = match ctx.channels.lookup(channel) {
            Some(record) => record,
            None => {
                actions.push(Action::Error(Error::new(
                    ErrorKind::InvalidChannelId,
                    format!("message for unknown channel {}", channel),
                )));
                return Ok(());
            }
        };

        record.lock().enqueue_message(message);
        events.push(Event::MessageOutEnqueued { channel });

        Ok(())
    }
}

/// Drains a channel's egress queue into padded, fixed-size packets. Header
/// metadata is filled here; the checksum is left to the next stage.
pub struct BundleStage {
    log: Logger,
}

impl BundleStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> BundleStage {
        BundleStage {
            log: logging::child(log),
        }
    }
}

impl Stage for BundleStage {
    fn name(&self) -> &'static str {
        "message-bundling"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(
            event,
            Event::MessageOutEnqueued { .. } | Event::UserDataToSend { .. }
        )
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let channel = match event {
            Event::MessageOutEnqueued { channel } | Event::UserDataToSend { channel } => channel,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("message-bundling cannot consume {}", other.name()),
                ));
            }
        };

        let record = match ctx.channels.lookup(channel) {
            Some(record) => record,
            None => {
                // The channel went away between enqueue and bundling; the
                // event becomes a no-op.
                logging::debug!(self.log, "bundling for vanished channel skipped";
                                "context" => "bundle",
                                "channel" => %channel);
                return Ok(());
            }
        };

        let mut guard = record.lock();

        while guard.has_queued_messages() {
            let slot = ctx.pool.allocate()?;
            let mut packet = Packet::prepare(slot)?;

            packet.set_sender(&ctx.node_id);
            packet.set_recipient(&ctx.peer_id);
            packet.set_channel(channel);
            packet.set_sequence(guard.next_sequence());

            let max_payload = packet.max_payload_size();
            let mut offset = 0;

            while let Some(size) = guard.front_message_size() {
                if offset + size > max_payload {
                    break;
                }

                let message = guard.pop_message().expect("Queue emptied under us");
                let payload = packet.payload_mut();
                offset += message.write(&mut payload[offset..])?;
            }

            if offset == 0 {
                // The front message alone exceeds the payload; drop it or
                // the queue never drains.
                guard.pop_message();
                actions.push(Action::Error(Error::new(
                    ErrorKind::Write,
                    "message exceeds the packet payload",
                )));
                continue;
            }

            packet.set_payload_size(offset as u16)?;
            packet.write_padding();

            logging::trace!(self.log, "packet bundled";
                            "context" => "bundle",
                            "channel" => %channel,
                            "payload_size" => offset);

            events.push(Event::PacketOut { packet });
        }

        Ok(())
    }
}

/// Writes the CRC-32 into the footer.
pub struct ChecksumStage {
    log: Logger,
}

impl ChecksumStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> ChecksumStage {
        ChecksumStage {
            log: logging::child(log),
        }
    }
}

impl Stage for ChecksumStage {
    fn name(&self) -> &'static str {
        "add-checksum"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketOut { .. })
    }

    fn process(
        &mut self,
        _ctx: &mut ConnectionContext,
        event: Event,
        _actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let mut packet = match event {
            Event::PacketOut { packet } => packet,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("add-checksum cannot consume {}", other.name()),
                ));
            }
        };

        packet.write_checksum();
        events.push(Event::PacketOut { packet });

        Ok(())
    }
}

/// Deposits the finished packet in its channel's egress buffer.
pub struct OutBufferStage {
    log: Logger,
}

impl OutBufferStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> OutBufferStage {
        OutBufferStage {
            log: logging::child(log),
        }
    }
}

impl Stage for OutBufferStage {
    fn name(&self) -> &'static str {
        "out-buffer"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketOut { .. })
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
        _actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let packet = match event {
            Event::PacketOut { packet } => packet,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("out-buffer cannot consume {}", other.name()),
                ));
            }
        };

        let channel = packet.channel();

        match ctx.channels.lookup(channel) {
            Some(record) => {
                record.lock().push_packet(packet);
                events.push(Event::PacketOutEnqueued { channel });
            }
            None => {
                logging::debug!(self.log, "packet for vanished channel dropped";
                                "context" => "out_buffer",
                                "channel" => %channel);
            }
        }

        Ok(())
    }
}

/// Notifies the pipeline owner that a packet is ready for the transport.
pub struct CallbackStage {
    callbacks: Rc<Callbacks>,
    log: Logger,
}

impl CallbackStage {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(callbacks: Rc<Callbacks>, log: L) -> CallbackStage {
        CallbackStage {
            callbacks,
            log: logging::child(log),
        }
    }
}

impl Stage for CallbackStage {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::PacketOutEnqueued { .. })
    }

    fn process(
        &mut self,
        _ctx: &mut ConnectionContext,
        event: Event,
        _actions: &mut Vec<Action>,
        _events: &mut Vec<Event>,
    ) -> ProtocolResult<()> {
        let channel = match event {
            Event::PacketOutEnqueued { channel } => channel,
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("callback cannot consume {}", other.name()),
                ));
            }
        };

        logging::trace!(self.log, "packet ready"; "context" => "callback", "channel" => %channel);

        (self.callbacks.on_packet_ready)(channel);

        Ok(())
    }
}
