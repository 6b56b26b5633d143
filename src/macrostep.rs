//! Macrostep Driver (C8) — [MODULE: macrostep]. Per spec.md §4.6: the
//! eventless-then-internal completion loop, pending-invoke execution at
//! every macrostep boundary, and the external-event injection entry point.
//! Generalizes the teacher's `Update`-schedule system pair
//! (`check_always_on_guards_changed`, `tick_after_system`) — which relies on
//! Bevy's own scheduler to repeatedly poll — into an explicit, bounded loop
//! this crate drives itself, since there is no ECS scheduler underneath it.

use crate::configuration::Configuration;
use crate::datamodel::Datamodel;
use crate::dispatcher::EventDispatcher;
use crate::document::Document;
use crate::error::SessionError;
use crate::history::HistoryStore;
use crate::invoke::{ChildSessionFactory, InvokeManager};
use crate::microstep::{self, MicrostepCtx};
use crate::queue::{Event, EventQueues};
use crate::transitions;

use serde_json::Value;
use std::collections::HashSet;

/// Safety bound on the eventless-transition loop within one macrostep (§4.6
/// "Safety bounds"). Exceeding this is a malformed-document symptom (a cycle
/// of eventless transitions that never quiesces), not a normal outcome.
pub const EVENTLESS_ITERATION_CAP: usize = 1_000;

/// Safety bound on the overall macrostep-completion loop (eventless rounds
/// plus one queued event each, repeated).
pub const MACROSTEP_ITERATION_CAP: usize = 1_000;

/// Everything one macrostep-completion loop needs. Short-lived: borrowed by
/// [`crate::session::Session`] for the duration of `start`/`send`/`tick` and
/// never stored.
pub struct MacrostepCtx<'a> {
    pub doc: &'a Document,
    pub config: &'a mut Configuration,
    pub history: &'a mut HistoryStore,
    pub queues: &'a mut EventQueues,
    pub model: &'a mut dyn Datamodel,
    pub dispatcher: &'a mut dyn EventDispatcher,
    pub invokes: &'a mut InvokeManager,
    pub session_id: &'a str,
    pub late_initialized: &'a mut HashSet<crate::document::StateId>,
    pub to_parent: &'a mut Vec<Event>,
    pub event_raiser: Option<&'a mut dyn FnMut(&str, &Value)>,
}

impl<'a> MacrostepCtx<'a> {
    fn microstep_ctx(&mut self) -> MicrostepCtx<'_> {
        MicrostepCtx {
            doc: self.doc,
            config: self.config,
            history: self.history,
            queues: self.queues,
            model: self.model,
            dispatcher: self.dispatcher,
            invokes: self.invokes,
            session_id: self.session_id,
            late_initialized: self.late_initialized,
            to_parent: self.to_parent,
            event_raiser: self.event_raiser.as_deref_mut(),
        }
    }
}

/// Result of running a completion loop: whether the session should halt
/// (top-level final entered), and whether it hit the iteration cap (fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Quiescent,
    Halted,
    Overflow,
}

/// §4.6 "while an eventless transition is enabled: select, execute." Runs at
/// most [`EVENTLESS_ITERATION_CAP`] microsteps before reporting overflow.
fn drain_eventless(ctx: &mut MacrostepCtx) -> LoopOutcome {
    for _ in 0..EVENTLESS_ITERATION_CAP {
        let (selected, errors) =
            transitions::select_transitions(ctx.doc, ctx.config.active_states(), None, ctx.model, ctx.session_id);
        for e in errors {
            ctx.queues.raise_internal(e);
        }
        if selected.is_empty() {
            return LoopOutcome::Quiescent;
        }
        let halted = microstep::run_microstep(&mut ctx.microstep_ctx(), &selected);
        if halted {
            return LoopOutcome::Halted;
        }
    }
    tracing::error!(session = ctx.session_id, "eventless transition loop exceeded iteration cap");
    LoopOutcome::Overflow
}

/// §4.6 "macrostep-completion loop": eventless transitions drain first (I4's
/// conflict-resolution keeps this well-defined even under parallel regions),
/// then one event is popped from the internal queue (never the external
/// queue — that only happens once this whole loop returns to quiescence,
/// per §4.6's outer "external event injection" step and P4).
pub fn run_completion_loop(ctx: &mut MacrostepCtx) -> LoopOutcome {
    for _ in 0..MACROSTEP_ITERATION_CAP {
        match drain_eventless(ctx) {
            LoopOutcome::Halted => return LoopOutcome::Halted,
            LoopOutcome::Overflow => return LoopOutcome::Overflow,
            LoopOutcome::Quiescent => {}
        }

        let Some(event) = ctx.queues.pop_internal() else {
            return LoopOutcome::Quiescent;
        };
        let event_name = event.name.clone();
        let (selected, errors) = transitions::select_transitions(
            ctx.doc,
            ctx.config.active_states(),
            Some(&event_name),
            ctx.model,
            ctx.session_id,
        );
        for e in errors {
            ctx.queues.raise_internal(e);
        }
        if !selected.is_empty() {
            let halted = microstep::run_microstep(&mut ctx.microstep_ctx(), &selected);
            if halted {
                return LoopOutcome::Halted;
            }
        }
    }
    tracing::error!(session = ctx.session_id, "macrostep completion loop exceeded iteration cap");
    LoopOutcome::Overflow
}

/// §4.6 "execute pending invokes (for currently active states only)": start
/// every invoke deferred during entry whose owning state is still in the
/// configuration. Called at every macrostep boundary, not just at `start`.
pub fn run_pending_invokes(
    doc: &Document,
    config: &Configuration,
    invokes: &mut InvokeManager,
    model: &mut dyn Datamodel,
    session_id: &str,
    queues: &mut EventQueues,
    factory: &mut dyn ChildSessionFactory,
) {
    let (assignments, errors) = invokes.start_pending(
        config.active_states(),
        |id| doc.state(id).sid.clone(),
        model,
        session_id,
        factory,
    );
    for (runtime_id, idlocation) in assignments {
        if let Some(location) = idlocation {
            if let Err(e) = model.set_variable(session_id, &location, serde_json::Value::String(runtime_id)) {
                tracing::warn!(session_id, location = %location, error = %e, "invoke idlocation assignment failed");
            }
        }
    }
    for error in errors {
        queues.raise_internal(error);
    }
}

/// §4.6 "on start": top-level scripts (failure rejects the document, handled
/// by the caller), data-model init per binding mode, the synthetic initial
/// microstep, then one full completion loop plus pending invokes — all
/// before the first external event is ever considered.
pub fn run_start_sequence(ctx: &mut MacrostepCtx) -> Result<LoopOutcome, SessionError> {
    if ctx.doc.get_binding_mode() == crate::document::BindingMode::Early {
        crate::datamodel::initialize_all_early(ctx.model, ctx.session_id, ctx.doc)
            .map_err(|e| SessionError::TopLevelScriptFailed(e.to_string()))?;
    }

    for script in ctx.doc.get_top_level_scripts() {
        if let crate::document::Action::Script { src } = script {
            if let Err(e) = ctx.model.execute_script(ctx.session_id, src) {
                return Err(SessionError::TopLevelScriptFailed(e.to_string()));
            }
        }
    }

    let halted = microstep::run_initial_microstep(&mut ctx.microstep_ctx());
    if halted {
        return Ok(LoopOutcome::Halted);
    }

    Ok(run_completion_loop(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::NullDatamodel;
    use crate::dispatcher::NullDispatcher;
    use crate::document::{Action, DocumentBuilder, StateKind, TransitionKind};
    use crate::invoke::NullChildSessionFactory;

    fn session_fixture() -> (Document, Configuration, HistoryStore, EventQueues, NullDatamodel, NullDispatcher, InvokeManager) {
        let doc = DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["a"], vec![], vec![], vec![], vec![], None)
            .state(
                "a",
                StateKind::Atomic,
                Some("root"),
                vec![],
                vec![vec![Action::Raise { event: "e1".into() }]],
                vec![],
                vec![],
                vec![],
                None,
            )
            .state("b", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .state("c", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("a", vec!["e1"], None, vec!["b"], TransitionKind::External, vec![])
            .transition("b", vec![], None, vec!["c"], TransitionKind::External, vec![])
            .build()
            .unwrap();
        (
            doc,
            Configuration::new(),
            HistoryStore::new(),
            EventQueues::new(),
            NullDatamodel,
            NullDispatcher,
            InvokeManager::new(),
        )
    }

    #[test]
    fn eventless_chain_with_internal_event_settles_without_external_input() {
        let (doc, mut config, mut history, mut queues, mut model, mut dispatcher, mut invokes) = session_fixture();
        let mut late = HashSet::new();
        let mut to_parent = Vec::new();
        let mut factory = NullChildSessionFactory;
        let outcome = {
            let mut ctx = MacrostepCtx {
                doc: &doc,
                config: &mut config,
                history: &mut history,
                queues: &mut queues,
                model: &mut model,
                dispatcher: &mut dispatcher,
                invokes: &mut invokes,
                session_id: "s1",
                late_initialized: &mut late,
                to_parent: &mut to_parent,
                event_raiser: None,
            };
            let outcome = run_start_sequence(&mut ctx).unwrap();
            run_pending_invokes(&doc, &config, &mut invokes, &mut model, "s1", &mut queues, &mut factory);
            outcome
        };
        assert_eq!(outcome, LoopOutcome::Quiescent);
        let c = doc.find_state_by_id("c").unwrap();
        assert!(config.is_active(c));
        assert_eq!(config.active_states().len(), 1);
    }
}
