//! Microstep Executor (C7) — [MODULE: microstep]. Per spec.md §4.5: given a
//! resolved transition set, exit → transition actions → entry, with history
//! recording before exit (I5), invoke cancellation after onexit but before
//! configuration removal (I6), block-isolated onentry/onexit (§4.5.1), and
//! `done.state.*` generation (§4.5 step 8, delegated to [`crate::datamodel`]
//! for the donedata half). Generalizes the teacher's `transition_observer`
//! (a single Bevy observer reacting to one `Transition` event) into a plain
//! function operating on a conflict-resolved *set* of transitions, since one
//! microstep can move several parallel regions at once.

use std::collections::HashSet;

use serde_json::Value;

use crate::configuration::Configuration;
use crate::datamodel::{self, Datamodel, DoneDataOutcome};
use crate::dispatcher::{DispatchRequest, EventDispatcher};
use crate::document::{Action, Block, Document, IfBranch, SendAction, StateId, StateKind};
use crate::hierarchy;
use crate::history::HistoryStore;
use crate::invoke::InvokeManager;
use crate::queue::{Event, EventQueues, EventType};
use crate::transitions::{self, compute_exit_set, transition_domain};
use crate::document::TransitionId;

/// Everything one microstep needs, bundled so the executor's functions don't
/// carry a dozen parameters. Borrowed fresh by [`crate::macrostep`] for
/// every microstep; never stored.
pub struct MicrostepCtx<'a> {
    pub doc: &'a Document,
    pub config: &'a mut Configuration,
    pub history: &'a mut HistoryStore,
    pub queues: &'a mut EventQueues,
    pub model: &'a mut dyn Datamodel,
    pub dispatcher: &'a mut dyn EventDispatcher,
    pub invokes: &'a mut InvokeManager,
    pub session_id: &'a str,
    /// States whose late-bound data items have already been initialised
    /// (§4.8: "subsequent entries do not re-assign").
    pub late_initialized: &'a mut HashSet<StateId>,
    /// Outbound `#_parent` sends, drained by the owning session after the
    /// macrostep (§4.5.2, §5 "Cross-session").
    pub to_parent: &'a mut Vec<Event>,
    /// §6.4 `event_raiser_callback`: invoked for every `raise` (and internal
    /// `send`) action so a host can observe/record it.
    pub event_raiser: Option<&'a mut dyn FnMut(&str, &Value)>,
}

fn notify_raiser(ctx: &mut MicrostepCtx, name: &str, data: &Value) {
    if let Some(cb) = ctx.event_raiser.as_deref_mut() {
        cb(name, data);
    }
}

fn sort_by_depth_desc_docorder_desc(doc: &Document, states: &mut Vec<StateId>) {
    states.sort_by(|&a, &b| {
        let da = hierarchy::depth(doc, a);
        let db = hierarchy::depth(doc, b);
        db.cmp(&da).then_with(|| hierarchy::doc_order(doc, b).cmp(&hierarchy::doc_order(doc, a)))
    });
}

fn sort_by_depth_asc_docorder_asc(doc: &Document, states: &mut Vec<StateId>) {
    states.sort_by(|&a, &b| {
        let da = hierarchy::depth(doc, a);
        let db = hierarchy::depth(doc, b);
        da.cmp(&db).then_with(|| hierarchy::doc_order(doc, a).cmp(&hierarchy::doc_order(doc, b)))
    });
}

/// States strictly below `state` (not including it), drilling into
/// initial/history children for compounds and every region for parallels.
/// Mirrors the teacher's `get_all_leaf_states` walk, minus the `Commands`
/// side effects (this crate has no ECS to trigger events on).
fn compute_descent(doc: &Document, history: &HistoryStore, state: StateId) -> Vec<StateId> {
    let mut result = Vec::new();
    let mut frontier = vec![state];
    while let Some(s) = frontier.pop() {
        match doc.state(s).kind {
            StateKind::Parallel => {
                for &c in &doc.state(s).children {
                    result.push(c);
                    frontier.push(c);
                }
            }
            StateKind::Compound => {
                for c in history.initial_or_history_child(doc, s) {
                    result.push(c);
                    frontier.push(c);
                }
            }
            StateKind::Atomic | StateKind::Final | StateKind::History(_) => {}
        }
    }
    result
}

/// §4.5 step 5: entry path from `domain` (exclusive) down to `target`
/// (inclusive), continuing into `target`'s own initial/history/parallel
/// descent. When `target` is itself a history pseudo-state, resolves it
/// first (§3.10 / history restore) — the restored (or default) targets each
/// get their own ancestor path and descent.
fn entry_states_for_target(doc: &Document, history: &HistoryStore, domain: StateId, target: StateId) -> Vec<StateId> {
    let mut result = Vec::new();
    if doc.state(target).is_history() {
        let (resolved, _was_restored) = history.restore(doc, target);
        for rt in resolved {
            result.extend(hierarchy::entry_path(doc, domain, rt));
            result.extend(compute_descent(doc, history, rt));
        }
    } else {
        result.extend(hierarchy::entry_path(doc, domain, target));
        result.extend(compute_descent(doc, history, target));
    }
    result
}

fn run_block(ctx: &mut MicrostepCtx, block: &Block) {
    let previous = ctx.queues.is_immediate_mode();
    ctx.queues.set_immediate_mode(false);
    for action in block {
        if execute_action(ctx, action).is_err() {
            break;
        }
    }
    ctx.queues.set_immediate_mode(previous);
}

/// §4.5.1: each block stops on its own first failure; later blocks on the
/// same state still run in full.
fn run_blocks(ctx: &mut MicrostepCtx, blocks: &[Block]) {
    for block in blocks {
        run_block(ctx, block);
    }
}

/// Runs a flat list of actions as a single block. Used for `<invoke>`
/// finalize content (§4.7 step 2), which per W3C is not itself
/// block-structured the way onentry/onexit are.
pub fn run_finalize(ctx: &mut MicrostepCtx, actions: &[Action]) {
    run_block(ctx, &actions.to_vec());
}

/// Runs block-structured onexit content outside the normal microstep path.
/// Used only by `Session::stop` for the top-level shutdown sweep, which
/// §4.5 step 9 says happens "not during microstep 3".
pub fn run_onexit_blocks(ctx: &mut MicrostepCtx, blocks: &[Block]) {
    run_blocks(ctx, blocks);
}

fn raise_error_execution(ctx: &mut MicrostepCtx, detail: impl Into<String>) {
    ctx.queues.raise_internal(Event::error_execution(detail));
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// §4.5.2: action effects. `Err` means "stop the enclosing block"; the
/// triggering error has already been raised as an internal event.
fn execute_action(ctx: &mut MicrostepCtx, action: &Action) -> Result<(), ()> {
    match action {
        Action::Raise { event } => {
            notify_raiser(ctx, event, &Value::Null);
            ctx.queues.raise_internal(Event::new(event.clone(), EventType::Internal));
            Ok(())
        }
        Action::Send(send) => execute_send(ctx, send),
        Action::Cancel { sendid, sendidexpr } => {
            let id = resolve_id(ctx, sendid.as_deref(), sendidexpr.as_deref());
            if let Some(id) = id {
                ctx.dispatcher.cancel(&id);
            }
            Ok(())
        }
        Action::Assign { location, expr } => match ctx.model.evaluate_expression(ctx.session_id, expr) {
            Ok(value) => match ctx.model.set_variable(ctx.session_id, location, value) {
                Ok(()) => Ok(()),
                Err(e) => {
                    raise_error_execution(ctx, format!("assign to '{location}' failed: {e}"));
                    Err(())
                }
            },
            Err(e) => {
                raise_error_execution(ctx, format!("assign expr '{expr}' failed: {e}"));
                Err(())
            }
        },
        Action::Script { src } => match ctx.model.execute_script(ctx.session_id, src) {
            Ok(()) => Ok(()),
            Err(e) => {
                raise_error_execution(ctx, format!("script failed: {e}"));
                Err(())
            }
        },
        Action::Log { label, expr } => {
            if let Some(expr) = expr {
                match ctx.model.evaluate_expression(ctx.session_id, expr) {
                    Ok(value) => {
                        tracing::info!(label = label.as_deref().unwrap_or(""), %value, "scxml log");
                        Ok(())
                    }
                    Err(e) => {
                        raise_error_execution(ctx, format!("log expr failed: {e}"));
                        Err(())
                    }
                }
            } else {
                tracing::info!(label = label.as_deref().unwrap_or(""), "scxml log");
                Ok(())
            }
        }
        Action::If(branches) => execute_if(ctx, branches),
        Action::Foreach { array, item, index, actions } => execute_foreach(ctx, array, item, index.as_deref(), actions),
    }
}

fn resolve_id(ctx: &mut MicrostepCtx, literal: Option<&str>, expr: Option<&str>) -> Option<String> {
    if let Some(id) = literal {
        return Some(id.to_string());
    }
    let expr = expr?;
    match ctx.model.evaluate_expression(ctx.session_id, expr) {
        Ok(Value::String(s)) => Some(s),
        Ok(v) => Some(v.to_string()),
        Err(_) => None,
    }
}

fn execute_send(ctx: &mut MicrostepCtx, send: &SendAction) -> Result<(), ()> {
    let event_name = match (&send.event, &send.eventexpr) {
        (Some(name), _) => name.clone(),
        (None, Some(expr)) => match ctx.model.evaluate_expression(ctx.session_id, expr) {
            Ok(Value::String(s)) => s,
            Ok(v) => v.to_string(),
            Err(e) => {
                raise_error_execution(ctx, format!("send eventexpr failed: {e}"));
                return Err(());
            }
        },
        (None, None) => String::new(),
    };

    let target = match (&send.target, &send.targetexpr) {
        (Some(t), _) => Some(t.clone()),
        (None, Some(expr)) => match ctx.model.evaluate_expression(ctx.session_id, expr) {
            Ok(Value::String(s)) => Some(s),
            Ok(v) => Some(v.to_string()),
            Err(e) => {
                raise_error_execution(ctx, format!("send targetexpr failed: {e}"));
                return Err(());
            }
        },
        (None, None) => None,
    };

    let data = build_send_data(ctx, send)?;

    match target.as_deref() {
        None | Some("#_internal") => {
            notify_raiser(ctx, &event_name, &data);
            ctx.queues.raise_internal(Event::new(event_name, EventType::Internal).with_data(data));
        }
        Some("#_parent") => {
            let mut event = Event::new(event_name, EventType::External).with_data(data);
            if let Some(sendid) = &send.id {
                event = event.with_sendid(sendid.clone());
            }
            ctx.to_parent.push(event);
        }
        Some(other) => {
            let sendid = send.id.clone().unwrap_or_default();
            let request = DispatchRequest {
                sendid: &sendid,
                target: other,
                event: &event_name,
                data,
                delay_ms: send.delay_ms,
                type_: send.type_.as_deref(),
            };
            if let Err(e) = ctx.dispatcher.send(request) {
                ctx.queues.raise_internal(Event::error_communication(e.to_string()));
            }
        }
    }
    Ok(())
}

fn build_send_data(ctx: &mut MicrostepCtx, send: &SendAction) -> Result<Value, ()> {
    if let Some(content) = &send.content {
        return Ok(serde_json::from_str(content.trim()).unwrap_or_else(|_| Value::String(content.clone())));
    }
    if send.params.is_empty() && send.namelist.is_empty() {
        return Ok(Value::Null);
    }
    let mut map = serde_json::Map::new();
    for name in &send.namelist {
        match ctx.model.evaluate_expression(ctx.session_id, name) {
            Ok(value) => {
                map.insert(name.clone(), value);
            }
            Err(e) => {
                raise_error_execution(ctx, format!("send namelist '{name}' failed: {e}"));
                return Err(());
            }
        }
    }
    for param in &send.params {
        let expr = param.expr.as_deref().unwrap_or(&param.location);
        match ctx.model.evaluate_expression(ctx.session_id, expr) {
            Ok(value) => {
                map.insert(param.name.clone(), value);
            }
            Err(e) => {
                raise_error_execution(ctx, format!("send param '{}' failed: {e}", param.name));
                return Err(());
            }
        }
    }
    Ok(Value::Object(map))
}

fn execute_if(ctx: &mut MicrostepCtx, branches: &[IfBranch]) -> Result<(), ()> {
    for branch in branches {
        let take = match &branch.cond {
            None => true,
            Some(cond) => match ctx.model.evaluate_expression(ctx.session_id, cond) {
                Ok(value) => truthy(&value),
                Err(e) => {
                    raise_error_execution(ctx, format!("if cond '{cond}' failed: {e}"));
                    return Err(());
                }
            },
        };
        if take {
            for action in &branch.actions {
                execute_action(ctx, action)?;
            }
            return Ok(());
        }
    }
    Ok(())
}

fn execute_foreach(
    ctx: &mut MicrostepCtx,
    array: &str,
    item: &str,
    index: Option<&str>,
    actions: &[Action],
) -> Result<(), ()> {
    let array_value = match ctx.model.evaluate_expression(ctx.session_id, array) {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            raise_error_execution(ctx, format!("foreach array '{array}' is not an array"));
            return Err(());
        }
        Err(e) => {
            raise_error_execution(ctx, format!("foreach array '{array}' failed: {e}"));
            return Err(());
        }
    };
    for (i, value) in array_value.into_iter().enumerate() {
        ctx.model
            .set_variable(ctx.session_id, item, value)
            .map_err(|e| raise_error_execution(ctx, format!("foreach item assign failed: {e}")))?;
        if let Some(index_var) = index {
            ctx.model
                .set_variable(ctx.session_id, index_var, Value::from(i))
                .map_err(|e| raise_error_execution(ctx, format!("foreach index assign failed: {e}")))?;
        }
        for action in actions {
            execute_action(ctx, action)?;
        }
    }
    Ok(())
}

fn maybe_late_init(ctx: &mut MicrostepCtx, state: StateId) {
    if ctx.doc.get_binding_mode() != crate::document::BindingMode::Late {
        return;
    }
    if !ctx.late_initialized.insert(state) {
        return;
    }
    if let Err(e) = datamodel::initialize_late_on_entry(ctx.model, ctx.session_id, ctx.doc, state) {
        raise_error_execution(ctx, format!("late data-model init failed: {e}"));
    }
}

/// §4.9: build and raise `done.state.<sid>`, honoring the structural
/// suppress / runtime-drop-and-continue split.
fn emit_done_state(ctx: &mut MicrostepCtx, compound: StateId) {
    let donedata = ctx.doc.state(compound).donedata.as_ref();
    let (outcome, errors) = datamodel::build_donedata(ctx.model, ctx.session_id, donedata);
    for e in errors {
        raise_error_execution(ctx, e);
    }
    if let DoneDataOutcome::Emit(data) = outcome {
        let sid = &ctx.doc.state(compound).sid;
        ctx.queues.raise_internal(Event::done_state(sid).with_data(data));
    }
}

fn parallel_region_has_final(doc: &Document, active: &HashSet<StateId>, region: StateId) -> bool {
    active
        .iter()
        .any(|&s| (s == region || hierarchy::is_descendant(doc, s, region)) && matches!(doc.state(s).kind, StateKind::Final))
}

/// §4.5 step 8: a final child of a compound state generates `done.state.X`;
/// when this completes every region of an enclosing parallel, also generate
/// `done.state.P` for that parallel (one level of nesting — see `DESIGN.md`
/// for the documented limit on deeper nested-parallel cascades).
fn emit_done_state_events(ctx: &mut MicrostepCtx, final_state: StateId) {
    let Some(parent) = ctx.doc.state(final_state).parent else { return };
    emit_done_state(ctx, parent);

    if let Some(grandparent) = ctx.doc.state(parent).parent {
        if matches!(ctx.doc.state(grandparent).kind, StateKind::Parallel)
            && ctx
                .doc
                .state(grandparent)
                .children
                .iter()
                .all(|&region| parallel_region_has_final(ctx.doc, ctx.config.active_states(), region))
        {
            let sid = ctx.doc.state(grandparent).sid.clone();
            ctx.queues.raise_internal(Event::done_state(&sid));
        }
    }
}

/// Enters every state in `entry_list` (already ordered shallowest-first,
/// document-order tie-break), running onentry blocks, deferring invokes,
/// and generating `done.state.*`. Returns whether this entered a top-level
/// final (§4.5 step 9 — session halt).
fn enter_states(ctx: &mut MicrostepCtx, entry_list: &[StateId]) -> bool {
    let root = ctx.doc.get_root_state();
    let mut newly_entered_finals = Vec::new();

    for &s in entry_list {
        ctx.config.insert(s);
        maybe_late_init(ctx, s);
        let onentry = ctx.doc.state(s).onentry.clone();
        run_blocks(ctx, &onentry);
        if !ctx.doc.state(s).invokes.is_empty() {
            ctx.invokes.defer(s, ctx.doc.state(s).invokes.clone());
        }
        if matches!(ctx.doc.state(s).kind, StateKind::Final) {
            newly_entered_finals.push(s);
        }
    }

    for &f in &newly_entered_finals {
        emit_done_state_events(ctx, f);
    }

    newly_entered_finals.iter().any(|&f| ctx.doc.state(f).parent == Some(root))
}

fn exit_states(ctx: &mut MicrostepCtx, exit_list: &[StateId]) {
    for &s in exit_list {
        if ctx.doc.state(s).children.iter().any(|c| ctx.doc.state(*c).is_history()) {
            ctx.history.record(ctx.doc, s, ctx.config.active_states());
        }
    }
    for &s in exit_list {
        let onexit = ctx.doc.state(s).onexit.clone();
        run_blocks(ctx, &onexit);
        ctx.invokes.cancel_owned_by(s);
        ctx.config.remove(s);
    }
}

/// §4.5: the full microstep for a conflict-resolved transition set selected
/// by [`transitions::select_transitions`]. Returns whether the session
/// should halt (a top-level final was entered).
pub fn run_microstep(ctx: &mut MicrostepCtx, selected: &[TransitionId]) -> bool {
    let mut ordered_selected = selected.to_vec();
    ordered_selected.sort_by_key(|&tid| ctx.doc.transition(tid).doc_order);

    let mut exit_union: Vec<StateId> = Vec::new();
    let mut seen_exit = HashSet::new();
    for &tid in &ordered_selected {
        let t = ctx.doc.transition(tid);
        for s in compute_exit_set(ctx.doc, ctx.config.active_states(), t) {
            if seen_exit.insert(s) {
                exit_union.push(s);
            }
        }
    }
    sort_by_depth_desc_docorder_desc(ctx.doc, &mut exit_union);
    exit_states(ctx, &exit_union);

    for &tid in &ordered_selected {
        let actions = ctx.doc.transition(tid).actions.clone();
        run_block(ctx, &actions);
    }

    let mut entry_list: Vec<StateId> = Vec::new();
    let mut seen_entry = HashSet::new();
    for &tid in &ordered_selected {
        let t = ctx.doc.transition(tid);
        if t.is_targetless() {
            continue;
        }
        let domain = transition_domain(ctx.doc, t);
        for &target in &t.targets {
            for s in entry_states_for_target(ctx.doc, ctx.history, domain, target) {
                if seen_entry.insert(s) {
                    entry_list.push(s);
                }
            }
        }
    }
    sort_by_depth_asc_docorder_asc(ctx.doc, &mut entry_list);

    enter_states(ctx, &entry_list)
}

/// §4.6 "enter initial configuration via a single microstep whose
/// 'transitions' are synthetic: target list = the document's initial
/// states". There is nothing to exit and no transition actions to run.
pub fn run_initial_microstep(ctx: &mut MicrostepCtx) -> bool {
    let root = ctx.doc.get_root_state();
    let mut entry_list = vec![root];
    entry_list.extend(compute_descent(ctx.doc, ctx.history, root));
    sort_by_depth_asc_docorder_asc(ctx.doc, &mut entry_list);
    enter_states(ctx, &entry_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::NullDatamodel;
    use crate::dispatcher::NullDispatcher;
    use crate::document::{DocumentBuilder, StateKind, TransitionKind};
    use crate::invoke::InvokeManager;

    fn linear_doc() -> Document {
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["a"], vec![], vec![], vec![], vec![], None)
            .state("a", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .state("b", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("a", vec!["e"], None, vec!["b"], TransitionKind::External, vec![])
            .build()
            .unwrap()
    }

    #[test]
    fn initial_microstep_enters_default_child() {
        let doc = linear_doc();
        let mut config = Configuration::new();
        let mut history = HistoryStore::new();
        let mut queues = EventQueues::new();
        let mut model = NullDatamodel;
        let mut dispatcher = NullDispatcher;
        let mut invokes = InvokeManager::new();
        let mut late = HashSet::new();
        let mut to_parent = Vec::new();
        let mut ctx = MicrostepCtx {
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
        let halted = run_initial_microstep(&mut ctx);
        assert!(!halted);
        let a = doc.find_state_by_id("a").unwrap();
        assert!(config.is_active(a));
    }

    #[test]
    fn simple_transition_moves_active_state() {
        let doc = linear_doc();
        let mut config = Configuration::new();
        let mut history = HistoryStore::new();
        let mut queues = EventQueues::new();
        let mut model = NullDatamodel;
        let mut dispatcher = NullDispatcher;
        let mut invokes = InvokeManager::new();
        let mut late = HashSet::new();
        let mut to_parent = Vec::new();
        {
            let mut ctx = MicrostepCtx {
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
            run_initial_microstep(&mut ctx);
        }
        let (selected, errors) = transitions::select_transitions(&doc, config.active_states(), Some("e"), &mut model, "s1");
        assert!(errors.is_empty());
        assert_eq!(selected.len(), 1);
        let mut ctx = MicrostepCtx {
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
        run_microstep(&mut ctx, &selected);
        let b = doc.find_state_by_id("b").unwrap();
        let a = doc.find_state_by_id("a").unwrap();
        assert!(config.is_active(b));
        assert!(!config.is_active(a));
    }
}
