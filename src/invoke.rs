//! Invoke Manager (C9) — [MODULE: invoke]. Per spec.md §4.7: deferral during
//! entry, execution at the macrostep boundary for still-active owners,
//! cancellation on exit, and child→parent event routing (cancellation filter
//! → finalize → auto-forward → normal selection).
//!
//! Child sessions are an *external collaborator* (Design Notes: "reject
//! global singletons; accept constructor-injected collaborators"): this
//! module only knows the [`ChildHandle`] / [`ChildSessionFactory`] trait
//! shapes. [`crate::session::Session`] implements both, so a host wires a
//! real recursive interpreter without this module depending on `session.rs`.

use std::collections::HashMap;

use serde_json::Value;

use crate::datamodel::Datamodel;
use crate::document::{InvokeDecl, StateId};
use crate::queue::Event;

/// A running (or finished) invocation, as seen from the parent side. The
/// parent only ever calls `send` (parent→child, §5 "explicitly stepping the
/// child") and `drain_to_parent`/`is_done`/`stop`; everything else is the
/// child's own business.
pub trait ChildHandle {
    fn send(&mut self, event_name: &str, data: Value);
    /// Events the child has queued for its parent since the last drain,
    /// oldest first (§4.7 "the child pushes events to the parent's external
    /// queue").
    fn drain_to_parent(&mut self) -> Vec<Event>;
    fn is_done(&self) -> bool;
    fn stop(&mut self);
}

/// Constructs a [`ChildHandle`] for one `<invoke>` (§4.7 "create a child
/// session, pass params/namelist/content, register finalize XML, register
/// auto-forward flag"). A host implements this once per scripting/transport
/// stack it supports; this crate ships no default that can actually run a
/// nested interpreter (that would require this module to depend on
/// `session.rs`, which would make the dependency circular) — see
/// [`NullChildSessionFactory`] for the no-op stand-in and
/// `session::SessionChildFactory` for a real one built from `Session`
/// itself.
pub trait ChildSessionFactory {
    fn spawn(&mut self, invoke: &InvokeDecl, runtime_invokeid: &str, params: &HashMap<String, Value>) -> Box<dyn ChildHandle>;
}

/// Default factory: every invoke fails to start and is dropped, logged at
/// `warn!`. Mirrors [`crate::datamodel::NullDatamodel`] /
/// [`crate::dispatcher::NullDispatcher`]: a working no-op so a host can
/// exercise everything except actual nested interpretation before wiring in
/// a real one.
#[derive(Debug, Default)]
pub struct NullChildSessionFactory;

impl ChildSessionFactory for NullChildSessionFactory {
    fn spawn(&mut self, invoke: &InvokeDecl, runtime_invokeid: &str, _params: &HashMap<String, Value>) -> Box<dyn ChildHandle> {
        tracing::warn!(invokeid = %runtime_invokeid, type_ = %invoke.type_, "no child session factory configured; invoke dropped");
        Box::new(DeadChild)
    }
}

struct DeadChild;
impl ChildHandle for DeadChild {
    fn send(&mut self, _event_name: &str, _data: Value) {}
    fn drain_to_parent(&mut self) -> Vec<Event> {
        Vec::new()
    }
    fn is_done(&self) -> bool {
        true
    }
    fn stop(&mut self) {}
}

struct RunningInvoke {
    owner: StateId,
    autoforward: bool,
    finalize: Vec<crate::document::Action>,
    handle: Box<dyn ChildHandle>,
    cancelled: bool,
}

/// Deferral queue plus the live invoke table. Owned by [`crate::session::Session`].
#[derive(Default)]
pub struct InvokeManager {
    pending: HashMap<StateId, Vec<InvokeDecl>>,
    running: HashMap<String, RunningInvoke>,
    /// Per-state monotonic counter backing W3C 6.4.1 invoke id generation
    /// (`{state_id}.{n}`) when `<invoke>` has no explicit `id`.
    id_counters: HashMap<StateId, u32>,
}

impl InvokeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.7 "Deferral": called by the microstep executor when a state with
    /// `<invoke>` is entered. Not started yet.
    pub fn defer(&mut self, owner: StateId, invokes: Vec<InvokeDecl>) {
        if invokes.is_empty() {
            return;
        }
        self.pending.entry(owner).or_default().extend(invokes);
    }

    fn generate_id(&mut self, owner: StateId, state_sid: &str, invoke: &InvokeDecl) -> String {
        if let Some(id) = &invoke.idlocation {
            // idlocation assigns the generated id into the data model; the
            // generated id itself still follows the same rule below unless
            // an explicit `id` was given.
            let _ = id;
        }
        let counter = self.id_counters.entry(owner).or_insert(0);
        let n = *counter;
        *counter += 1;
        format!("{state_sid}.{n}")
    }

    /// §4.7 "Execution at macrostep boundary": start every pending invoke
    /// whose owning state is still active; drop the rest. Returns the
    /// `(runtime_invokeid, idlocation)` pairs so the caller can assign the
    /// generated id into the data model when `idlocation` was given, plus any
    /// `error.execution` events raised while evaluating a `namelist`/`param`
    /// against the parent's data model (§4.7 "pass params/namelist/content";
    /// a failed individual item is dropped, not fatal to the whole invoke).
    pub fn start_pending(
        &mut self,
        active: &std::collections::HashSet<StateId>,
        state_sid_of: impl Fn(StateId) -> String,
        model: &mut dyn Datamodel,
        session_id: &str,
        factory: &mut dyn ChildSessionFactory,
    ) -> (Vec<(String, Option<String>)>, Vec<Event>) {
        let mut assignments = Vec::new();
        let mut errors = Vec::new();
        let owners: Vec<StateId> = self.pending.keys().copied().collect();
        for owner in owners {
            if !active.contains(&owner) {
                self.pending.remove(&owner);
                continue;
            }
            let invokes = self.pending.remove(&owner).unwrap_or_default();
            let sid = state_sid_of(owner);
            for invoke in invokes {
                let runtime_id = invoke
                    .id
                    .clone()
                    .unwrap_or_else(|| self.generate_id(owner, &sid, &invoke));
                let params = resolve_invoke_params(model, session_id, &invoke, &mut errors);
                let handle = factory.spawn(&invoke, &runtime_id, &params);
                self.running.insert(
                    runtime_id.clone(),
                    RunningInvoke {
                        owner,
                        autoforward: invoke.autoforward,
                        finalize: invoke.finalize.clone(),
                        handle,
                        cancelled: false,
                    },
                );
                if invoke.idlocation.is_some() {
                    assignments.push((runtime_id, invoke.idlocation.clone()));
                }
            }
        }
        (assignments, errors)
    }

    /// §4.7 "Cancellation": called when `owner` exits, *after* its onexit
    /// actions run but *before* it is removed from the configuration (I6).
    pub fn cancel_owned_by(&mut self, owner: StateId) {
        let ids: Vec<String> = self
            .running
            .iter()
            .filter(|(_, inv)| inv.owner == owner && !inv.cancelled)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(inv) = self.running.get_mut(&id) {
                inv.handle.stop();
                inv.cancelled = true;
            }
        }
    }

    pub fn is_cancelled(&self, invokeid: &str) -> bool {
        self.running.get(invokeid).map(|i| i.cancelled).unwrap_or(true)
    }

    /// Every invokeid with an active, non-cancelled handle, for auto-forward
    /// fan-out (§4.7 step 3).
    pub fn autoforward_targets(&self) -> Vec<String> {
        self.running
            .iter()
            .filter(|(_, inv)| inv.autoforward && !inv.cancelled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn finalize_actions(&self, invokeid: &str) -> Vec<crate::document::Action> {
        self.running.get(invokeid).map(|i| i.finalize.clone()).unwrap_or_default()
    }

    pub fn send_to_child(&mut self, invokeid: &str, event_name: &str, data: Value) {
        if let Some(inv) = self.running.get_mut(invokeid) {
            if !inv.cancelled {
                inv.handle.send(event_name, data);
            }
        }
    }

    /// Drain every still-active child's pending parent-bound events. Called
    /// once per macrostep boundary by the macrostep driver.
    pub fn drain_child_events(&mut self) -> Vec<(String, Event)> {
        let mut out = Vec::new();
        for (id, inv) in self.running.iter_mut() {
            if inv.cancelled {
                continue;
            }
            for event in inv.handle.drain_to_parent() {
                out.push((id.clone(), event));
            }
        }
        out
    }

    /// Drop bookkeeping for invocations whose child has completed, so a
    /// stale `invokeid` can be reused as a map key without ambiguity.
    pub fn reap_finished(&mut self) {
        self.running.retain(|_, inv| !inv.handle.is_done());
    }

    pub fn stop_all(&mut self) {
        for inv in self.running.values_mut() {
            if !inv.cancelled {
                inv.handle.stop();
                inv.cancelled = true;
            }
        }
    }
}

/// §4.7 "pass params/namelist" against the *parent's* data model, before the
/// child session exists — mirrors `microstep::build_send_data`'s namelist
/// then params loop, but collects every item (dropping a failed one rather
/// than aborting the whole invoke) since `<invoke>` has no equivalent of a
/// send's single-content shortcut.
fn resolve_invoke_params(
    model: &mut dyn Datamodel,
    session_id: &str,
    invoke: &InvokeDecl,
    errors: &mut Vec<Event>,
) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    for name in &invoke.namelist {
        match model.evaluate_expression(session_id, name) {
            Ok(value) => {
                map.insert(name.clone(), value);
            }
            Err(e) => errors.push(Event::error_execution(format!("invoke namelist '{name}' failed: {e}"))),
        }
    }
    for param in &invoke.params {
        let expr = param.expr.as_deref().unwrap_or(&param.location);
        match model.evaluate_expression(session_id, expr) {
            Ok(value) => {
                map.insert(param.name.clone(), value);
            }
            Err(e) => errors.push(Event::error_execution(format!("invoke param '{}' failed: {e}", param.name))),
        }
    }
    map
}
