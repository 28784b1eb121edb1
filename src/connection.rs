//! The connection façade.
//!
//! A `NodeContext` carries everything shared across a node's connections:
//! its peer id, the packet pool, the cookie factory and the configuration.
//! A `Connection` pairs that with per-peer state (channel set, timeouts) and
//! the two pipelines, and exposes the user-facing operations. The façade
//! owns event routing: ingress results flow into egress or the user
//! notification path by category, actions are folded into callbacks.

use crate::channels::ChannelSet;
use crate::config::Config;
use crate::cookie::{CookieFactory, SecretGenerator};
use crate::event::{Action, Event, EventCategory, TransportAddr};
use crate::identity::{Capabilities, ChannelId, PeerId};
use crate::logging::{self, Logger};
use crate::message::{varint_size, DATA};
use crate::packet::ENVELOPE_SIZE;
use crate::pipe::{egress::egress_pipe, ingress::ingress_pipe, Pipe};
use crate::pool::{Pool, Slot};
use crate::support::{Error, ErrorKind, ProtocolResult};
use crate::sync::LockStrategy;
use crate::timeout::{SleepFn, TimeoutService};
use std::rc::Rc;
use std::time::Duration;

/// Host callbacks supplied at construction. The host may use interior
/// mutability to record notifications; the callbacks must not re-enter the
/// connection.
pub struct Callbacks {
    /// A handshake completed (or failed) for the given channel.
    pub on_channel_established: Box<dyn Fn(ProtocolResult<ChannelId>)>,
    /// A packet on the given channel is ready to hand to the transport.
    pub on_packet_ready: Box<dyn Fn(ChannelId)>,
    /// An established channel has ingress data of the given size.
    pub on_data_available: Box<dyn Fn(ChannelId, usize)>,
}

impl Callbacks {
    /// Callbacks that ignore every notification.
    pub fn noop() -> Callbacks {
        Callbacks {
            on_channel_established: Box::new(|_| ()),
            on_packet_ready: Box::new(|_| ()),
            on_data_available: Box::new(|_, _| ()),
        }
    }
}

/// Node-wide shared state.
pub struct NodeContext {
    peer_id: PeerId,
    pool: Pool,
    cookies: Rc<CookieFactory>,
    config: Config,
    strategy: LockStrategy,
    log: Logger,
}

impl NodeContext {
    /// A node with a freshly generated random peer id.
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: Config,
        secret: SecretGenerator,
        strategy: LockStrategy,
        log: L,
    ) -> NodeContext {
        Self::with_peer_id(PeerId::random(), config, secret, strategy, log)
    }

    /// A node with a caller-chosen peer id.
    pub fn with_peer_id<'a, L: Into<Option<&'a Logger>>>(
        peer_id: PeerId,
        config: Config,
        secret: SecretGenerator,
        strategy: LockStrategy,
        log: L,
    ) -> NodeContext {
        let log = logging::child(log);
        let pool = Pool::new(config.packet_size, config.block_capacity, strategy, &log);

        NodeContext {
            peer_id,
            pool,
            cookies: Rc::new(CookieFactory::new(secret)),
            config,
            strategy,
            log,
        }
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Expose pool allocation so the transport can fill buffers in place.
    #[inline]
    pub fn allocate(&self) -> ProtocolResult<Slot> {
        self.pool.allocate()
    }

    /// Host-driven pool housekeeping.
    #[inline]
    pub fn prune(&self) {
        self.pool.prune()
    }
}

/// Shared state the pipeline stages and state machines operate on.
pub struct ConnectionContext {
    pub node_id: PeerId,
    pub peer_id: PeerId,
    pub config: Config,
    pub pool: Pool,
    pub cookies: Rc<CookieFactory>,
    pub channels: ChannelSet,
    pub timeouts: TimeoutService,
    pub log: Logger,
}

impl ConnectionContext {
    pub fn new(node: &NodeContext, peer: PeerId, sleep: SleepFn, log: &Logger) -> ConnectionContext {
        ConnectionContext {
            node_id: node.peer_id,
            peer_id: peer,
            config: node.config.clone(),
            pool: node.pool.clone(),
            cookies: node.cookies.clone(),
            channels: ChannelSet::new(node.strategy, log),
            timeouts: TimeoutService::new(sleep, log),
            log: log.new(logging::o!()),
        }
    }
}

/// A connection to one remote peer.
pub struct Connection {
    ctx: ConnectionContext,
    ingress: Pipe,
    egress: Pipe,
    callbacks: Rc<Callbacks>,
    log: Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        node: &NodeContext,
        peer: PeerId,
        callbacks: Callbacks,
        sleep: SleepFn,
        log: L,
    ) -> Connection {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => node.log.new(logging::o!()),
        };

        let callbacks = Rc::new(callbacks);

        Connection {
            ctx: ConnectionContext::new(node, peer, sleep, &log),
            ingress: ingress_pipe(&node.config, &log),
            egress: egress_pipe(callbacks.clone(), &log),
            callbacks,
            log,
        }
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.ctx.peer_id
    }

    /// Begin establishing a new channel to the peer. Returns immediately;
    /// completion is reported through `on_channel_established`.
    pub fn establish_channel(&mut self) -> ProtocolResult<()> {
        let peer = self.ctx.peer_id;

        logging::debug!(self.log, "establishing channel"; "context" => "establish", "peer" => %peer);

        self.dispatch(Event::NewChannel { peer })?;
        Ok(())
    }

    /// Queue user bytes on an established channel. The handshake channel and
    /// incomplete ids are rejected outright.
    pub fn channel_write(&mut self, channel: ChannelId, data: &[u8]) -> ProtocolResult<usize> {
        if !channel.is_complete() {
            return Err(Error::new(
                ErrorKind::InvalidChannelId,
                format!("channel {} cannot carry user data", channel),
            ));
        }

        let encoded = varint_size(DATA) + varint_size(data.len() as u64) + data.len();
        if encoded > self.ctx.config.packet_size - ENVELOPE_SIZE {
            return Err(Error::new(
                ErrorKind::Write,
                format!("write of {} bytes exceeds the maximum payload", data.len()),
            ));
        }

        let actions = self.dispatch(Event::UserDataWritten {
            channel,
            data: data.to_vec(),
        })?;

        for action in actions {
            if let Action::Error(error) = action {
                return Err(error);
            }
        }

        Ok(data.len())
    }

    /// Pop the next ingress message payload into `buf`. Returns 0 when the
    /// channel has nothing buffered.
    pub fn channel_read(&mut self, channel: ChannelId, buf: &mut [u8]) -> ProtocolResult<usize> {
        let record = self.ctx.channels.get(channel).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidChannelId,
                format!("read from unknown channel {}", channel),
            )
        })?;

        let mut guard = record.lock();

        match guard.pop_ingress() {
            None => Ok(0),
            Some(span) => {
                if buf.len() < span.length {
                    // Keep the payload available for a retry with a larger
                    // buffer.
                    let length = span.length;
                    guard.push_ingress_front(span);

                    return Err(Error::new(
                        ErrorKind::InsufficientBufferSize,
                        format!("payload of {} bytes exceeds the read buffer", length),
                    ));
                }

                buf[..span.length].copy_from_slice(span.bytes());
                Ok(span.length)
            }
        }
    }

    /// Drive the ingress pipeline with a transport-delivered packet.
    pub fn received_packet(
        &mut self,
        src: TransportAddr,
        dst: TransportAddr,
        slot: Slot,
    ) -> ProtocolResult<()> {
        self.dispatch(Event::PacketReceived { src, dst, slot })?;
        Ok(())
    }

    /// Pop the next ready packet for the given channel (the handshake
    /// channel included), if any.
    pub fn packet_to_send(&mut self, channel: ChannelId) -> Option<Slot> {
        let record = self.ctx.channels.lookup(channel)?;
        let packet = record.lock().pop_packet()?;

        Some(packet.into_slot())
    }

    /// Expose pool allocation so the transport can fill slots in place.
    #[inline]
    pub fn allocate(&self) -> ProtocolResult<Slot> {
        self.ctx.pool.allocate()
    }

    /// Sleep via the host primitive and fire whatever deadlines elapsed.
    pub fn wait(&mut self, duration: Duration) -> ProtocolResult<()> {
        let expired = self.ctx.timeouts.wait(duration);

        for tag in expired {
            self.dispatch(Event::Timeout { tag })?;
        }

        Ok(())
    }

    /// Tear down a channel: cancel its timeouts, drop its record and every
    /// buffered slot.
    pub fn close_channel(&mut self, channel: ChannelId) -> ProtocolResult<()> {
        if channel.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidChannelId,
                "the handshake channel cannot be closed",
            ));
        }

        self.ctx.timeouts.cancel_scope(channel);
        if channel.is_complete() {
            self.ctx.timeouts.cancel_scope(channel.create_partial());
        }

        if !self.ctx.channels.remove(channel) {
            return Err(Error::new(
                ErrorKind::InvalidChannelId,
                format!("close of unknown channel {}", channel),
            ));
        }

        logging::debug!(self.log, "channel closed"; "context" => "close", "channel" => %channel);

        Ok(())
    }

    /// Capabilities negotiated for an established channel.
    pub fn channel_capabilities(&self, channel: ChannelId) -> Option<Capabilities> {
        self.ctx
            .channels
            .get(channel)
            .map(|record| record.lock().capabilities())
    }

    #[inline]
    pub fn has_established_channel(&self, channel: ChannelId) -> bool {
        self.ctx.channels.has_established_channel(channel)
    }

    #[inline]
    pub fn has_pending_channel(&self, channel: ChannelId) -> bool {
        self.ctx.channels.has_pending_channel(channel)
    }

    #[inline]
    pub fn established_channels(&self) -> Vec<ChannelId> {
        self.ctx.channels.established_ids()
    }

    #[inline]
    pub fn pending_channel_count(&self) -> usize {
        self.ctx.channels.pending_count()
    }

    /// Run one event through ingress, route the results by category and fold
    /// actions into callbacks. Returns the accumulated actions so callers
    /// can surface synchronous failures.
    fn dispatch(&mut self, event: Event) -> ProtocolResult<Vec<Action>> {
        let output = self.ingress.process(&mut self.ctx, event)?;
        let mut actions = output.actions;

        for event in output.events {
            match event.category() {
                EventCategory::Egress => {
                    let produced = self.egress.process(&mut self.ctx, event)?;
                    actions.extend(produced.actions);

                    for leftover in produced.events {
                        logging::warn!(self.log, "egress result event dropped";
                                       "context" => "dispatch",
                                       "event" => leftover.name());
                    }
                }
                EventCategory::User => self.handle_user_event(event),
                EventCategory::Ingress => {
                    logging::warn!(self.log, "unroutable result event dropped";
                                   "context" => "dispatch",
                                   "event" => event.name());
                }
            }
        }

        self.handle_actions(&actions);

        Ok(actions)
    }

    fn handle_user_event(&mut self, event: Event) {
        match event {
            Event::UserDataToRead { channel, span } => {
                let size = span.length;

                match self.ctx.channels.get(channel) {
                    Some(record) => record.lock().push_ingress(span),
                    None => {
                        // The channel vanished mid-flight; the data goes with it.
                        logging::debug!(self.log, "data for vanished channel dropped";
                                        "context" => "dispatch",
                                        "channel" => %channel);
                        return;
                    }
                }

                (self.callbacks.on_data_available)(channel, size);
            }
            other => {
                logging::warn!(self.log, "unexpected user event dropped";
                               "context" => "dispatch",
                               "event" => other.name());
            }
        }
    }

    fn handle_actions(&self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::NotifyChannelEstablished(channel) => {
                    (self.callbacks.on_channel_established)(Ok(*channel));
                }
                Action::Error(error) => {
                    logging::warn!(self.log, "pipeline error";
                                   "context" => "dispatch",
                                   "error" => %error);
                }
                // Filter actions were already absorbed by the route stage.
                _ => (),
            }
        }
    }
}
