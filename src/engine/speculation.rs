//! Predicate resolution and speculative execution.
//!
//! A launch with an unresolved predicate parks at scheduling unless the
//! mapper speculates a true outcome, in which case it runs ahead with the
//! `speculated` flag set. Resolution is not an error path: a false predicate
//! substitutes the launch's default result, discarding the real one if the
//! task already ran.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::record::{KindState, OpCell, PredicateState, Stage, Transition};
use crate::types::OpId;

use super::TaskEngine;

impl TaskEngine {
    /// Resolves `op`'s predicate to `value`.
    ///
    /// A parked launch either proceeds to scheduling or completes with its
    /// default result. A speculated launch that guessed right just clears
    /// its unresolved state; one that guessed wrong keeps running and has
    /// its result replaced at completion.
    pub fn resolve_predicate(self: &Arc<Self>, op: OpId, value: bool) -> Result<()> {
        let cell = self.with_op(op)?;
        enum Action {
            Run,
            Default,
            Settled,
        }
        let action = {
            let mut state = cell.state.lock();
            match state.predicate {
                PredicateState::True | PredicateState::False => Action::Settled,
                PredicateState::Unresolved { predicted } => {
                    let speculated_true = predicted == Some(true);
                    if value {
                        state.predicate = PredicateState::True;
                        if speculated_true {
                            // Ran ahead on a correct guess; nothing to redo.
                            Action::Settled
                        } else {
                            Action::Run
                        }
                    } else {
                        state.predicate = PredicateState::False;
                        if speculated_true {
                            // Misspeculation: the task is already in flight.
                            // `complete_execution` sees the false predicate
                            // and substitutes the default result.
                            debug!(op = %cell.unique, "misspeculated predicate");
                            Action::Settled
                        } else {
                            Action::Default
                        }
                    }
                }
            }
        };
        match action {
            Action::Run => {
                trace!(op = %cell.unique, "predicate resolved true, scheduling");
                self.schedule(op)
            }
            Action::Default => self.complete_with_default(&cell),
            Action::Settled => Ok(()),
        }
    }

    /// Completes a launch whose predicate resolved false before dispatch:
    /// the default result stands in and the task never runs.
    pub(crate) fn complete_with_default(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let (transition, mapped_event) = {
            let mut state = cell.state.lock();
            state.predicate = PredicateState::False;
            let default = self.default_result(&state);
            match &mut state.kind {
                KindState::Individual(s) => s.result = Some(default),
                KindState::Index(s) => {
                    // The default stands in for the whole launch; disable the
                    // deterministic fold so completion delivers it untouched.
                    s.reduction = Some(default);
                    s.deterministic = false;
                }
                KindState::Slice(_) | KindState::Point(_) | KindState::Shard(_) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_unique_id(cell.unique)
                        .with_node(self.config.node));
                }
            }
            // Waiters on the mapped event must not hang on a launch that
            // never maps.
            state.lifecycle.advance(Stage::Mapped);
            (state.lifecycle.record_complete(), state.mapped_event)
        };
        self.events.trigger(mapped_event);
        debug!(op = %cell.unique, "predicate false, default result substituted");
        if transition == Some(Transition::Complete) {
            self.apply_complete_transition(cell)?;
        }
        Ok(())
    }
}
