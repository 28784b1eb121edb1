//! Composable filter pipelines.
//!
//! A pipe is an ordered list of stages. An event entering the pipe is handed
//! to the first stage that accepts it; events a stage emits continue at the
//! next stage onward. Events that fall off the end are the pipe's results
//! and are routed by the owner. Actions accumulate across the traversal and
//! flow backward: every stage gets to observe them (the route stage builds
//! its ban lists this way) before they are returned.

use crate::connection::ConnectionContext;
use crate::event::{Action, Event};
use crate::logging::{self, Logger};
use crate::support::{Error, ErrorKind, ProtocolResult};
use std::collections::VecDeque;

pub mod egress;
pub mod ingress;

/// One pipeline stage. `accepts` gates which event kinds the stage consumes;
/// feeding a stage an event it does not accept is a programming fault.
pub trait Stage {
    fn name(&self) -> &'static str;

    fn accepts(&self, event: &Event) -> bool;

    fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
        actions: &mut Vec<Action>,
        events: &mut Vec<Event>,
    ) -> ProtocolResult<()>;

    /// Backward action flow; stages may react to actions produced further
    /// down the pipe.
    fn observe(&mut self, _action: &Action) {}
}

/// Everything a single event traversal produced: the backward-flowing
/// actions and the events no stage consumed.
#[derive(Debug)]
pub struct PipeOutput {
    pub actions: Vec<Action>,
    pub events: Vec<Event>,
}

pub struct Pipe {
    stages: Vec<Box<dyn Stage>>,
    log: Logger,
}

impl Pipe {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(stages: Vec<Box<dyn Stage>>, log: L) -> Pipe {
        Pipe {
            stages,
            log: logging::child(log),
        }
    }

    /// Drive one event through the pipe. Fails loudly only on programming
    /// faults (an entry event no stage accepts, or a stage invariant
    /// violation); protocol-level garbage is dropped quietly by the stages.
    pub fn process(
        &mut self,
        ctx: &mut ConnectionContext,
        event: Event,
    ) -> ProtocolResult<PipeOutput> {
        let mut actions = Vec::new();
        let mut results = Vec::new();
        let mut queue: VecDeque<(usize, Event)> = VecDeque::new();

        match self.accepting_stage(0, &event) {
            Some(index) => queue.push_back((index, event)),
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidPipeEvent,
                    format!("no stage accepts {}", event.name()),
                ));
            }
        }

        while let Some((index, event)) = queue.pop_front() {
            logging::trace!(self.log, "stage consuming event";
                            "context" => "process",
                            "stage" => self.stages[index].name(),
                            "event" => event.name());

            let mut emitted = Vec::new();
            self.stages[index].process(ctx, event, &mut actions, &mut emitted)?;

            for event in emitted {
                match self.accepting_stage(index + 1, &event) {
                    Some(next) => queue.push_back((next, event)),
                    None => results.push(event),
                }
            }
        }

        for action in &actions {
            for stage in self.stages.iter_mut() {
                stage.observe(action);
            }
        }

        Ok(PipeOutput {
            actions,
            events: results,
        })
    }

    #[inline]
    fn accepting_stage(&self, from: usize, event: &Event) -> Option<usize> {
        self.stages[from..]
            .iter()
            .position(|stage| stage.accepts(event))
            .map(|position| position + from)
    }
}
