//! Interpreter Session (C10) — [MODULE: session]. The host-facing facade
//! (§4.10) that owns one chart's configuration, queues, history, invokes,
//! and data-model session, and drives the macrostep driver in response to
//! `start`/`send`/`tick`. Generalizes the teacher's `GearboxPlugin` (which
//! wires systems into a shared Bevy `World` so many state machines run
//! side by side under one scheduler) into a single, self-contained executor
//! per chart, per §5's "single-threaded cooperative... one logical executor
//! per session" requirement.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::configuration::Configuration;
use crate::datamodel::{Datamodel, IoProcessorDescriptor, NullDatamodel};
use crate::dispatcher::{EventDispatcher, NullDispatcher};
use crate::document::{Document, StateId};
use crate::error::SessionError;
use crate::history::HistoryStore;
use crate::invoke::{ChildHandle, ChildSessionFactory, InvokeManager, NullChildSessionFactory};
use crate::macrostep::{self, LoopOutcome, MacrostepCtx};
use crate::queue::{Event, EventQueues, EventType};

/// Design Notes: "fold the boolean-flag soup into an explicit session state
/// machine so invalid transitions are unrepresentable." `InMicrostep` is
/// folded into `InMacrostep` here because every microstep already runs to
/// completion before this crate's own call stack can observe an
/// intermediate state (§5: "actions themselves are modelled as synchronous
/// from the session's point of view") — there is no externally visible
/// `InMicrostep{phase}` to distinguish from `InMacrostep` without the
/// scripting host itself being reentrant, which is its own non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    InMacrostep,
    Stopping,
    Stopped,
}

/// Callback registered by a host to observe every `raise` action (§6.4).
pub type EventRaiserCallback = Box<dyn FnMut(&str, &Value)>;
/// Invoked once when the session reaches a top-level final, after final
/// onexit runs (§6.4).
pub type CompletionCallback = Box<dyn FnMut()>;
/// Guard-only evaluation callback for subroutines that need a boolean
/// without borrowing the whole session (§6.4 `condition_evaluator`).
pub type ConditionEvaluator = Box<dyn Fn(&str) -> bool>;

/// One SCXML interpreter session (C10). Owns C3/C5–C9 for its lifetime;
/// the [`Document`] (C1) and [`Datamodel`]/[`EventDispatcher`]/
/// [`ChildSessionFactory`] collaborators are constructor-injected, never
/// global singletons (Design Notes).
pub struct Session {
    doc: Arc<Document>,
    session_id: String,
    state: SessionState,
    config: Configuration,
    history: HistoryStore,
    queues: EventQueues,
    invokes: InvokeManager,
    model: Box<dyn Datamodel>,
    dispatcher: Box<dyn EventDispatcher>,
    factory: Box<dyn ChildSessionFactory>,
    late_initialized: HashSet<StateId>,
    to_parent: Vec<Event>,
    /// §5 "_event is a stack": saved/restored around recursive processing.
    event_stack: Vec<Event>,
    /// §5 "reentrancy counter, not a recursive lock".
    reentrancy: u32,
    event_raiser_callback: Option<EventRaiserCallback>,
    completion_callback: Option<CompletionCallback>,
    condition_evaluator: Option<ConditionEvaluator>,
}

impl Session {
    /// §4.10 `load_model`: the one real entry point (`load`/`load_string`
    /// are the seam for a host-provided XML parser and are not implemented
    /// here — see SPEC_FULL.md §11).
    pub fn load_model(doc: Arc<Document>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let mut model: Box<dyn Datamodel> = Box::new(NullDatamodel);
        model.create_session(&session_id);
        Self {
            doc,
            session_id,
            state: SessionState::Idle,
            config: Configuration::new(),
            history: HistoryStore::new(),
            queues: EventQueues::new(),
            invokes: InvokeManager::new(),
            model,
            dispatcher: Box::new(NullDispatcher),
            factory: Box::new(NullChildSessionFactory),
            late_initialized: HashSet::new(),
            to_parent: Vec::new(),
            event_stack: Vec::new(),
            reentrancy: 0,
            event_raiser_callback: None,
            completion_callback: None,
            condition_evaluator: None,
        }
    }

    pub fn set_datamodel(&mut self, model: Box<dyn Datamodel>) {
        self.model = model;
        self.model.create_session(&self.session_id);
    }

    pub fn set_event_dispatcher(&mut self, dispatcher: Box<dyn EventDispatcher>) {
        self.dispatcher = dispatcher;
    }

    pub fn set_child_session_factory(&mut self, factory: Box<dyn ChildSessionFactory>) {
        self.factory = factory;
    }

    pub fn set_event_raiser(&mut self, callback: EventRaiserCallback) {
        self.event_raiser_callback = Some(callback);
    }

    pub fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.completion_callback = Some(callback);
    }

    pub fn set_condition_evaluator(&mut self, evaluator: ConditionEvaluator) {
        self.condition_evaluator = Some(evaluator);
    }

    pub fn condition_evaluator(&self) -> Option<&ConditionEvaluator> {
        self.condition_evaluator.as_ref()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Idle | SessionState::InMacrostep)
            && !self.config.is_empty()
    }

    pub fn active_states(&self) -> HashSet<&str> {
        self.config
            .active_states()
            .iter()
            .map(|&id| self.doc.state(id).sid.as_str())
            .collect()
    }

    /// The single active atomic leaf state, when unambiguous (the
    /// non-parallel common case used by scenario-style tests). Returns
    /// `None` for a parallel configuration with more than one active leaf.
    pub fn current_state(&self) -> Option<&str> {
        let leaves = crate::transitions::active_leaves(&self.doc, self.config.active_states());
        match leaves.as_slice() {
            [only] => Some(self.doc.state(*only).sid.as_str()),
            _ => None,
        }
    }

    pub fn is_state_active(&self, sid: &str) -> bool {
        self.doc
            .find_state_by_id(sid)
            .is_some_and(|id| self.config.is_active(id))
    }

    pub fn get_model(&self) -> &dyn Datamodel {
        self.model.as_ref()
    }

    fn macrostep_ctx(&mut self) -> MacrostepCtx<'_> {
        MacrostepCtx {
            doc: &self.doc,
            config: &mut self.config,
            history: &mut self.history,
            queues: &mut self.queues,
            model: self.model.as_mut(),
            dispatcher: self.dispatcher.as_mut(),
            invokes: &mut self.invokes,
            session_id: &self.session_id,
            late_initialized: &mut self.late_initialized,
            to_parent: &mut self.to_parent,
            event_raiser: self.event_raiser_callback.as_deref_mut(),
        }
    }

    /// Same borrows as [`Self::macrostep_ctx`], shaped for the microstep
    /// layer directly — used by finalize dispatch and the shutdown sweep,
    /// neither of which goes through a full macrostep-completion loop.
    fn as_microstep_ctx(&mut self) -> crate::microstep::MicrostepCtx<'_> {
        crate::microstep::MicrostepCtx {
            doc: &self.doc,
            config: &mut self.config,
            history: &mut self.history,
            queues: &mut self.queues,
            model: self.model.as_mut(),
            dispatcher: self.dispatcher.as_mut(),
            invokes: &mut self.invokes,
            session_id: &self.session_id,
            late_initialized: &mut self.late_initialized,
            to_parent: &mut self.to_parent,
            event_raiser: self.event_raiser_callback.as_deref_mut(),
        }
    }

    fn notify_raised(&mut self, event: &Event) {
        if let Some(cb) = self.event_raiser_callback.as_mut() {
            cb(&event.name, &event.data);
        }
    }

    fn after_loop(&mut self, outcome: LoopOutcome) -> Result<(), SessionError> {
        match outcome {
            LoopOutcome::Quiescent => {
                macrostep::run_pending_invokes(
                    &self.doc,
                    &self.config,
                    &mut self.invokes,
                    self.model.as_mut(),
                    &self.session_id,
                    &mut self.queues,
                    self.factory.as_mut(),
                );
                self.invokes.reap_finished();
                Ok(())
            }
            LoopOutcome::Halted => {
                self.state = SessionState::Stopping;
                self.run_shutdown();
                if let Some(cb) = self.completion_callback.as_mut() {
                    cb();
                }
                Ok(())
            }
            LoopOutcome::Overflow => {
                self.state = SessionState::Stopping;
                self.run_shutdown();
                Err(SessionError::IterationOverflow(macrostep::MACROSTEP_ITERATION_CAP))
            }
        }
    }

    /// §4.6 "on start". Idempotent against a session that has already
    /// started or stopped (§7 "lifecycle violation ... treated as a no-op").
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle || !self.config.is_empty() {
            tracing::debug!(session_id = %self.session_id, "start() called on an already-started session; ignored");
            return Ok(());
        }
        self.state = SessionState::InMacrostep;
        self.model.setup_system_variables(&self.session_id, self.doc.get_name().unwrap_or(""), &[] as &[IoProcessorDescriptor]);

        let outcome = {
            let mut ctx = self.macrostep_ctx();
            match macrostep::run_start_sequence(&mut ctx) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.state = SessionState::Stopped;
                    return Err(e);
                }
            }
        };
        self.state = SessionState::Idle;
        self.after_loop(outcome)
    }

    /// §4.10 `send`: push to the external queue and, if the caller is not
    /// already inside a macrostep (guarded by the reentrancy counter), pump
    /// one external-event injection round.
    pub fn send(&mut self, event_name: impl Into<String>, data: Value) -> Result<(), SessionError> {
        let event = Event::new(event_name, EventType::External).with_data(data);
        self.notify_raised(&event);
        self.queues.raise_external(event);
        if self.reentrancy > 0 || !self.is_running() {
            return Ok(());
        }
        self.tick()
    }

    /// §4.10 `step`/`tick`: manual pumping for callers that want to drive
    /// delayed-send polling or drain a single externally injected event
    /// themselves, while still going through the full ordering machinery.
    pub fn tick(&mut self) -> Result<(), SessionError> {
        if !self.is_running() || self.state != SessionState::Idle {
            return Ok(());
        }
        self.reentrancy += 1;
        let _guard = scopeguard::guard(&mut self.reentrancy, |r| **r -= 1);
        self.state = SessionState::InMacrostep;

        let outcome = if let Some(event) = self.queues.pop_external() {
            self.push_current_event(event);
            let outcome = {
                let mut ctx = self.macrostep_ctx();
                macrostep::run_completion_loop(&mut ctx)
            };
            self.pop_current_event();
            outcome
        } else {
            LoopOutcome::Quiescent
        };
        self.route_child_events();
        self.state = SessionState::Idle;
        self.after_loop(outcome)
    }

    /// §5 "`_event` is a stack": set the system variable for the event about
    /// to be processed, saving the prior value so it can be restored once
    /// this (possibly recursive) round of processing completes.
    fn push_current_event(&mut self, event: Event) {
        let value = event_to_value(&event);
        self.event_stack.push(event);
        let _ = self.model.set_variable(&self.session_id, "_event", value);
    }

    fn pop_current_event(&mut self) {
        self.event_stack.pop();
        if let Some(previous) = self.event_stack.last() {
            let value = event_to_value(previous);
            let _ = self.model.set_variable(&self.session_id, "_event", value);
        }
    }

    /// §4.7 step 2/3: drain every still-active child's parent-bound events,
    /// filter cancelled originators, run finalize before the event is
    /// processed, then auto-forward (skipping platform events) before the
    /// event re-enters normal transition selection via the external queue.
    fn route_child_events(&mut self) {
        let drained = self.invokes.drain_child_events();
        for (invokeid, event) in drained {
            if self.invokes.is_cancelled(&invokeid) {
                continue;
            }
            let finalize = self.invokes.finalize_actions(&invokeid);
            if !finalize.is_empty() {
                let mut microstep_ctx = self.as_microstep_ctx();
                crate::microstep::run_finalize(&mut microstep_ctx, &finalize);
            }
            if !event.is_platform() {
                for target in self.invokes.autoforward_targets() {
                    self.invokes.send_to_child(&target, &event.name, event.data.clone());
                }
            }
            self.queues.raise_external(event);
        }
    }

    /// Drain events raised for `#_parent` since the last call, so a host
    /// embedding this session as a child via [`ChildHandle`] can forward
    /// them into the actual parent session (§5 "Cross-session ... no shared
    /// mutable data" — this crate has no parent pointer of its own).
    pub fn drain_to_parent(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.to_parent)
    }

    fn run_shutdown(&mut self) {
        let mut exit_order: Vec<StateId> = self.config.active_states().iter().copied().collect();
        exit_order.sort_by(|&a, &b| {
            let da = crate::hierarchy::depth(&self.doc, a);
            let db = crate::hierarchy::depth(&self.doc, b);
            db.cmp(&da).then_with(|| {
                crate::hierarchy::doc_order(&self.doc, b).cmp(&crate::hierarchy::doc_order(&self.doc, a))
            })
        });
        for state in exit_order {
            let onexit = self.doc.state(state).onexit.clone();
            let mut microstep_ctx = self.as_microstep_ctx();
            crate::microstep::run_onexit_blocks(&mut microstep_ctx, &onexit);
            self.invokes.cancel_owned_by(state);
            self.config.remove(state);
        }
        self.invokes.stop_all();
        self.state = SessionState::Stopped;
    }

    /// §4.10 `stop`: idempotent (§7 "lifecycle violation ... treated as a
    /// no-op rather than thrown"). Exits all active states in reverse
    /// document order, cancels invokes, destroys the scripting session.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped || self.config.is_empty() {
            tracing::debug!(session_id = %self.session_id, "stop() called on an already-stopped session; ignored");
            self.state = SessionState::Stopped;
            return;
        }
        self.state = SessionState::Stopping;
        self.run_shutdown();
        self.model.destroy_session(&self.session_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // §5 "Cancellation semantics": clear the event-raiser callback
        // before releasing the session so an async scheduler holding a
        // reference to it cannot re-enter freed state, then tear down.
        self.event_raiser_callback = None;
        self.completion_callback = None;
        if self.state != SessionState::Stopped {
            self.stop();
        }
    }
}

/// Bridges a [`Session`] into the [`ChildSessionFactory`]/[`ChildHandle`]
/// shape `invoke.rs` expects, without `invoke.rs` itself depending on this
/// module (Design Notes: "accept constructor-injected collaborators" rather
/// than a circular module dependency).
pub struct SessionChildHandle {
    child: Session,
}

impl SessionChildHandle {
    pub fn new(child: Session) -> Self {
        Self { child }
    }
}

impl ChildHandle for SessionChildHandle {
    fn send(&mut self, event_name: &str, data: Value) {
        let _ = self.child.send(event_name.to_string(), data);
    }

    fn drain_to_parent(&mut self) -> Vec<Event> {
        self.child.drain_to_parent()
    }

    fn is_done(&self) -> bool {
        !self.child.is_running()
    }

    fn stop(&mut self) {
        self.child.stop();
    }
}

/// Builds a real nested interpreter for each `<invoke type="scxml">`, using
/// the same [`Document`] the parent loaded (the common "invoke yourself as a
/// sub-chart" case); hosts invoking other document types provide their own
/// [`ChildSessionFactory`].
pub struct SessionChildFactory {
    doc: Arc<Document>,
    next_child_ordinal: u32,
}

impl SessionChildFactory {
    pub fn new(doc: Arc<Document>) -> Self {
        Self { doc, next_child_ordinal: 0 }
    }
}

impl ChildSessionFactory for SessionChildFactory {
    fn spawn(
        &mut self,
        _invoke: &crate::document::InvokeDecl,
        runtime_invokeid: &str,
        params: &std::collections::HashMap<String, Value>,
    ) -> Box<dyn ChildHandle> {
        self.next_child_ordinal += 1;
        let child_session_id = format!("{runtime_invokeid}.{}", self.next_child_ordinal);
        let mut child = Session::load_model(Arc::clone(&self.doc), child_session_id);
        let child_session_id = child.session_id.clone();
        for (name, value) in params {
            let _ = child.model.set_variable(&child_session_id, name, value.clone());
        }
        if let Err(e) = child.start() {
            tracing::warn!(error = %e, "invoked child session failed to start");
        }
        Box::new(SessionChildHandle::new(child))
    }
}

/// §6.2 "`_event` system variable": the JSON shape handed to the data model
/// while `event` is being processed (§5 "`_event` is a stack").
fn event_to_value(event: &Event) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("name".into(), Value::String(event.name.clone()));
    let type_str = match event.type_ {
        EventType::Platform => "platform",
        EventType::Internal => "internal",
        EventType::External => "external",
    };
    map.insert("type".into(), Value::String(type_str.into()));
    map.insert("data".into(), event.data.clone());
    map.insert(
        "sendid".into(),
        event.sendid.clone().map(Value::String).unwrap_or(Value::Null),
    );
    map.insert(
        "invokeid".into(),
        event.invokeid.clone().map(Value::String).unwrap_or(Value::Null),
    );
    map.insert(
        "origin".into(),
        event.origin.clone().map(Value::String).unwrap_or(Value::Null),
    );
    map.insert(
        "origintype".into(),
        event.origintype.clone().map(Value::String).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentBuilder, StateKind, TransitionKind};

    fn door_doc() -> Document {
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["a"], vec![], vec![], vec![], vec![], None)
            .state("a", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .state("b", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("a", vec!["e"], None, vec!["b"], TransitionKind::External, vec![])
            .build()
            .unwrap()
    }

    #[test]
    fn simple_transition_scenario() {
        let doc = Arc::new(door_doc());
        let mut session = Session::load_model(doc, "test");
        session.start().unwrap();
        assert_eq!(session.current_state(), Some("a"));
        session.send("e", Value::Null).unwrap();
        assert_eq!(session.current_state(), Some("b"));
    }

    #[test]
    fn stop_is_idempotent() {
        let doc = Arc::new(door_doc());
        let mut session = Session::load_model(doc, "test");
        session.start().unwrap();
        session.stop();
        session.stop();
        assert!(!session.is_running());
    }
}
