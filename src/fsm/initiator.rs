//! Channel establishment from the initiating side.
//!
//! Per in-flight initiator half the lifecycle is IDLE → SENT_NEW →
//! ESTABLISHED; the pending set and the timeout table carry the state, so
//! the machine itself holds nothing but a logger.

use crate::connection::ConnectionContext;
use crate::event::{Action, Event};
use crate::fsm::Fsm;
use crate::identity::{Capabilities, ChannelId, PeerId, DEFAULT_CHANNELID};
use crate::logging::{self, Logger};
use crate::message::Message;
use crate::packet::Packet;
use crate::timeout::{ScopedTag, TimeoutTag};

pub struct InitiatorFsm {
    log: Logger,
}

impl InitiatorFsm {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> InitiatorFsm {
        InitiatorFsm {
            log: logging::child(log),
        }
    }

    /// Pick a fresh pending channel, send CHANNEL_NEW on the handshake
    /// channel and arm the acknowledge timeout.
    fn handle_new_channel(
        &mut self,
        ctx: &mut ConnectionContext,
        peer: PeerId,
        events: &mut Vec<Event>,
    ) {
        let id = ctx.channels.new_pending_channel();
        let cookie = ctx.cookies.initiator(&ctx.node_id, &peer, id.initiator());

        logging::debug!(self.log, "initiating channel";
                        "context" => "new_channel",
                        "channel" => %id,
                        "peer" => %peer);

        events.push(Event::MessageOut {
            channel: DEFAULT_CHANNELID,
            message: Message::ChannelNew {
                initiator: id.initiator(),
                cookie,
            },
        });

        ctx.timeouts
            .add(ScopedTag::new(id, TimeoutTag::New), ctx.config.new_timeout());
    }

    /// CHANNEL_ACKNOWLEDGE: verify our own cookie, promote the pending
    /// partial to a full channel and answer with CHANNEL_FINALIZE (or
    /// CHANNEL_COOKIE when egress data is already queued).
    fn handle_acknowledge(
        &mut self,
        ctx: &mut ConnectionContext,
        packet: &Packet,
        channel: ChannelId,
        initiator_cookie: crate::cookie::Cookie,
        responder_cookie: crate::cookie::Cookie,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) {
        if !channel.is_complete() {
            logging::debug!(self.log, "acknowledge with incomplete channel id dropped";
                            "context" => "acknowledge",
                            "channel" => %channel);
            return;
        }

        let partial = channel.create_partial();
        if !ctx.channels.has_pending_channel(partial) {
            logging::trace!(self.log, "acknowledge for unknown pending channel ignored";
                            "context" => "acknowledge",
                            "channel" => %channel);
            return;
        }

        // The cookie must be the one we minted for this half; anything else
        // means the responder echoed a stale or forged handshake.
        if !ctx.cookies.validate_initiator(
            initiator_cookie,
            &ctx.node_id,
            &packet.sender(),
            channel.initiator(),
        ) {
            logging::warn!(self.log, "acknowledge cookie mismatch, aborting handshake";
                           "context" => "acknowledge",
                           "channel" => %channel);

            ctx.channels.drop_pending_channel(partial);
            ctx.timeouts.remove(&ScopedTag::new(partial, TimeoutTag::New));
            return;
        }

        let record = match ctx.channels.make_full(channel) {
            Ok(record) => record,
            Err(error) => {
                logging::warn!(self.log, "unable to promote channel";
                               "context" => "acknowledge",
                               "channel" => %channel,
                               "error" => %error);
                return;
            }
        };

        ctx.timeouts.remove(&ScopedTag::new(partial, TimeoutTag::New));
        ctx.timeouts.add(
            ScopedTag::new(channel, TimeoutTag::Channel),
            ctx.config.channel_timeout(),
        );

        let capabilities = Capabilities::from_raw(ctx.config.capabilities);
        let buffered = {
            let mut guard = record.lock();
            guard.set_capabilities(capabilities);
            guard.has_queued_messages()
        };

        if buffered {
            // Egress data is already waiting; ride the cookie on the new
            // channel so the flush can follow immediately.
            events.push(Event::MessageOut {
                channel,
                message: Message::ChannelCookie {
                    cookie: responder_cookie,
                    capabilities,
                },
            });
            events.push(Event::UserDataToSend { channel });
        } else {
            events.push(Event::MessageOut {
                channel: DEFAULT_CHANNELID,
                message: Message::ChannelFinalize {
                    channel,
                    cookie: responder_cookie,
                    capabilities,
                },
            });
        }

        actions.push(Action::NotifyChannelEstablished(channel));
    }

    /// An armed deadline fired; the channel it guarded goes away. A later
    /// revision retries with backoff instead.
    fn handle_timeout(&mut self, ctx: &mut ConnectionContext, tag: ScopedTag) {
        logging::debug!(self.log, "channel timed out";
                        "context" => "timeout",
                        "tag" => %tag);

        ctx.channels.remove(tag.scope);
        ctx.timeouts.cancel_scope(tag.scope);
    }
}

impl Fsm for InitiatorFsm {
    fn name(&self) -> &'static str {
        "initiator"
    }

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: &Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> bool {
        match event {
            Event::NewChannel { peer } => {
                self.handle_new_channel(ctx, *peer, events);
                true
            }
            Event::MessageReceived {
                packet,
                message:
                    Message::ChannelAcknowledge {
                        channel,
                        initiator_cookie,
                        responder_cookie,
                    },
                ..
            } => {
                self.handle_acknowledge(
                    ctx,
                    packet,
                    *channel,
                    *initiator_cookie,
                    *responder_cookie,
                    actions,
                    events,
                );
                true
            }
            Event::Timeout { tag } => {
                self.handle_timeout(ctx, *tag);
                true
            }
            _ => false,
        }
    }
}
