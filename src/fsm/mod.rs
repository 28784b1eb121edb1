//! Finite state machines driving the handshake and data transport.
//!
//! The registry owns a fixed set of machines and broadcasts every event to
//! all of them. An event nobody recognises is a protocol-level surprise; the
//! registry reports it and the pipeline drops the event.

use crate::connection::ConnectionContext;
use crate::event::{Action, Event};
use crate::logging::{self, Logger};

pub mod data;
pub mod initiator;
pub mod responder;

pub use self::data::DataFsm;
pub use self::initiator::InitiatorFsm;
pub use self::responder::ResponderFsm;

/// A state machine participating in event dispatch. Returns whether it
/// recognised and handled the event; actions and follow-up events are
/// appended to the supplied collections.
pub trait Fsm {
    fn name(&self) -> &'static str;

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: &Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> bool;
}

/// The mandatory machine set: channel initiation, the stateless responder,
/// and user data transport.
pub struct FsmRegistry {
    initiator: InitiatorFsm,
    responder: ResponderFsm,
    data: DataFsm,
    log: Logger,
}

impl FsmRegistry {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> FsmRegistry {
        let log = logging::child(log);

        FsmRegistry {
            initiator: InitiatorFsm::new(&log),
            responder: ResponderFsm::new(&log),
            data: DataFsm::new(&log),
            log,
        }
    }

    /// Broadcast the event to every machine. Returns false when none of them
    /// recognised it.
    pub fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: &Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> bool {
        let mut handled = false;

        handled |= self.initiator.process(ctx, event, actions, events);
        handled |= self.responder.process(ctx, event, actions, events);
        handled |= self.data.process(ctx, event, actions, events);

        if !handled {
            logging::warn!(self.log, "no state machine handled the event";
                           "context" => "process",
                           "event" => event.name());
        }

        handled
    }
}
