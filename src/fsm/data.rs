//! User data transport over established channels.

use crate::channels::DataSpan;
use crate::connection::ConnectionContext;
use crate::event::{Action, Event};
use crate::fsm::Fsm;
use crate::identity::ChannelId;
use crate::logging::{self, Logger};
use crate::message::{DataSegment, Message};
use crate::packet::{Packet, ENVELOPE_SIZE};

pub struct DataFsm {
    log: Logger,
}

impl DataFsm {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> DataFsm {
        DataFsm {
            log: logging::child(log),
        }
    }

    /// Inbound DATA: hand the payload span (still backed by the packet slot,
    /// no copy) to the user notification path.
    fn handle_data(
        &mut self,
        packet: &Packet,
        channel: &Option<crate::channels::ChannelRef>,
        segment: &DataSegment,
        events: &mut Vec<Event>,
    ) {
        let record = match channel {
            Some(record) => record,
            None => {
                // Early data on a still-pending channel; dropped until the
                // resend capability lands.
                logging::trace!(self.log, "data on pending channel dropped";
                                "context" => "data");
                return;
            }
        };

        let id = record.lock().id();
        if id.is_empty() {
            logging::warn!(self.log, "data on the handshake channel dropped";
                           "context" => "data");
            return;
        }

        if let DataSegment::Span { offset, length } = segment {
            events.push(Event::UserDataToRead {
                channel: id,
                span: DataSpan {
                    slot: packet.clone_slot(),
                    offset: *offset,
                    length: *length,
                },
            });
        }
    }

    /// User write: queue the bytes as a DATA message on the channel's egress
    /// queue and wake the egress path.
    fn handle_write(
        &mut self,
        ctx: &mut ConnectionContext,
        channel: ChannelId,
        data: &[u8],
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) {
        let record = match ctx.channels.get(channel) {
            Some(record) => record,
            None => {
                actions.push(Action::Error(crate::support::Error::new(
                    crate::support::ErrorKind::InvalidChannelId,
                    format!("write to unknown channel {}", channel),
                )));
                return;
            }
        };

        let message = Message::Data(DataSegment::Owned(data.to_vec()));

        // Fragmentation is a future extension; oversized writes drop here.
        if message.encoded_size() > ctx.config.packet_size - ENVELOPE_SIZE {
            actions.push(Action::Error(crate::support::Error::new(
                crate::support::ErrorKind::Write,
                format!(
                    "message of {} bytes exceeds the maximum payload",
                    data.len()
                ),
            )));
            return;
        }

        record.lock().enqueue_message(message);

        logging::trace!(self.log, "user data queued";
                        "context" => "write",
                        "channel" => %channel,
                        "size" => data.len());

        events.push(Event::UserDataToSend { channel });
    }
}

impl Fsm for DataFsm {
    fn name(&self) -> &'static str {
        "data"
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: &Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> bool {
        match event {
            Event::MessageReceived {
                packet,
                channel,
                message: Message::Data(segment),
                ..
            } => {
                self.handle_data(packet, channel, segment, events);
                true
            }
            Event::UserDataWritten { channel, data } => {
                self.handle_write(ctx, *channel, data, actions, events);
                true
            }
            _ => false,
        }
    }
}
