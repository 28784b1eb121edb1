//! Channel establishment from the responding side.
//!
//! Deliberately stateless with respect to in-flight handshakes: the cookie
//! carries everything needed to verify CHANNEL_FINALIZE, so a flood of NEW
//! messages pins no memory here.

use crate::connection::ConnectionContext;
use crate::cookie::Cookie;
use crate::event::{Action, Event};
use crate::fsm::Fsm;
use crate::identity::{Capabilities, ChannelId};
use crate::logging::{self, Logger};
use crate::message::Message;
use crate::packet::Packet;
use crate::timeout::{ScopedTag, TimeoutTag};

pub struct ResponderFsm {
    log: Logger,
}

impl ResponderFsm {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> ResponderFsm {
        ResponderFsm {
            log: logging::child(log),
        }
    }

    /// CHANNEL_NEW: pick (or reuse) a full id for the advertised initiator
    /// half and answer with CHANNEL_ACKNOWLEDGE. Nothing is recorded; the
    /// responder cookie is the handshake state.
    fn handle_new(
        &mut self,
        ctx: &mut ConnectionContext,
        packet: &Packet,
        initiator: u16,
        cookie: Cookie,
        events: &mut Vec<Event>,
    ) {
        let partial = ChannelId::new(initiator, 0);

        if ctx.channels.has_pending_channel(partial) {
            // Both sides picked the same half and initiated towards each
            // other; drop ours and let the retry sort it out.
            logging::warn!(self.log, "crossed handshake for initiator half, dropping ours";
                           "context" => "channel_new",
                           "channel" => %partial);

            ctx.channels.drop_pending_channel(partial);
            ctx.timeouts.remove(&ScopedTag::new(partial, TimeoutTag::New));
            return;
        }

        let full = match ctx.channels.get_established_id(partial) {
            Some(id) => id,
            None => match ctx.channels.complete_channelid(partial) {
                Ok(id) => id,
                Err(error) => {
                    logging::warn!(self.log, "unable to complete channel id";
                                   "context" => "channel_new",
                                   "channel" => %partial,
                                   "error" => %error);
                    return;
                }
            },
        };

        let responder_cookie = ctx
            .cookies
            .responder(&packet.sender(), &packet.recipient(), full);

        logging::debug!(self.log, "acknowledging channel";
                        "context" => "channel_new",
                        "channel" => %full);

        events.push(Event::MessageOut {
            channel: packet.channel(),
            message: Message::ChannelAcknowledge {
                channel: full,
                initiator_cookie: cookie,
                responder_cookie,
            },
        });
    }

    /// CHANNEL_FINALIZE: validate the cookie we minted at acknowledge time
    /// and establish the channel. Mismatches drop silently; the initiator
    /// retries by timeout.
    fn handle_finalize(
        &mut self,
        ctx: &mut ConnectionContext,
        packet: &Packet,
        channel: ChannelId,
        cookie: Cookie,
        capabilities: Capabilities,
        actions: &mut Vec<Action>,
    ) {
        if !channel.is_complete() {
            logging::debug!(self.log, "finalize with incomplete channel id dropped";
                            "context" => "finalize",
                            "channel" => %channel);
            return;
        }

        let partial = channel.create_partial();
        if ctx.channels.has_pending_channel(partial) {
            logging::warn!(self.log, "crossed finalize for pending half, dropping ours";
                           "context" => "finalize",
                           "channel" => %channel);

            ctx.channels.drop_pending_channel(partial);
            ctx.timeouts.remove(&ScopedTag::new(partial, TimeoutTag::New));
            return;
        }

        if ctx.channels.has_established_channel(channel) {
            logging::trace!(self.log, "finalize for established channel ignored";
                            "context" => "finalize",
                            "channel" => %channel);
            return;
        }

        if !ctx
            .cookies
            .validate_responder(cookie, &packet.sender(), &packet.recipient(), channel)
        {
            logging::debug!(self.log, "finalize cookie mismatch dropped";
                            "context" => "finalize",
                            "channel" => %channel);
            return;
        }

        match ctx.channels.add(channel) {
            Ok(Some(record)) => {
                record.lock().set_capabilities(capabilities);
            }
            _ => {
                logging::warn!(self.log, "unable to establish channel";
                               "context" => "finalize",
                               "channel" => %channel);
                return;
            }
        }

        ctx.timeouts.add(
            ScopedTag::new(channel, TimeoutTag::Channel),
            ctx.config.channel_timeout(),
        );

        logging::debug!(self.log, "channel established";
                        "context" => "finalize",
                        "channel" => %channel);

        actions.push(Action::NotifyChannelEstablished(channel));
    }
}

impl Fsm for ResponderFsm {
    fn name(&self) -> &'static str {
        "responder"
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
                message: Message::ChannelNew { initiator, cookie },
                ..
            } => {
                self.handle_new(ctx, packet, *initiator, *cookie, events);
                true
            }
            Event::MessageReceived {
                packet,
                message:
                    Message::ChannelFinalize {
                        channel,
                        cookie,
                        capabilities,
                    },
                ..
            } => {
                self.handle_finalize(ctx, packet, *channel, *cookie, *capabilities, actions);
                true
            }
            Event::MessageReceived {
                message: Message::ChannelCookie { .. },
                ..
            } => {
                // Reserved for the early-data extension; nothing to do yet.
                logging::trace!(self.log, "channel cookie received";
                                "context" => "process");
                true
            }
            _ => false,
        }
    }
}
