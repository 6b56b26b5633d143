//! Transition Selector (C6) — [MODULE: transitions]. Per spec.md §4.4:
//! candidate gathering, event descriptor matching, guard evaluation, exit-set
//! computation, and Appendix D.2 conflict resolution. Generalizes the
//! teacher's static `Guards` check (empty-set-is-enabled) into dynamic
//! per-event, per-state selection against a live [`crate::document::Document`].

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::datamodel::Datamodel;
use crate::document::{Document, StateId, StateKind, Transition, TransitionId, TransitionKind};
use crate::hierarchy;
use crate::queue::Event;

/// W3C SCXML 5.9.3 (P5): tokenise on whitespace; `*` matches anything;
/// `foo.*` matches anything with that dot-prefix; `foo` matches `foo` and
/// `foo.bar` but not `foobar`.
pub fn matches_event_descriptor(event_name: &str, descriptor: &str) -> bool {
    for token in descriptor.split_whitespace() {
        if token == "*" {
            return true;
        }
        if token.ends_with(".*") {
            // drop only the trailing '*', keeping the dot: "foo.*" -> "foo."
            let prefix = &token[..token.len() - 1];
            if event_name.starts_with(prefix) {
                return true;
            }
            continue;
        }
        if event_name == token {
            return true;
        }
        if let Some(rest) = event_name.strip_prefix(token) {
            if rest.starts_with('.') {
                return true;
            }
        }
    }
    false
}

fn event_matches_transition(transition: &Transition, event_name: Option<&str>) -> bool {
    match event_name {
        None => transition.is_eventless(),
        Some(name) => {
            !transition.is_eventless()
                && transition.events.iter().any(|d| matches_event_descriptor(name, d))
        }
    }
}

/// §4.4 "Internal vs external semantics": a transition of type `internal`
/// behaves as external unless source is compound (not parallel, not atomic)
/// *and* every target is a proper descendant of source.
pub fn is_strict_internal(doc: &Document, transition: &Transition) -> bool {
    if transition.kind != TransitionKind::Internal || transition.is_targetless() {
        return false;
    }
    let source = transition.source;
    if !matches!(doc.state(source).kind, StateKind::Compound) {
        return false;
    }
    transition
        .targets
        .iter()
        .all(|&t| t != source && hierarchy::is_descendant(doc, t, source))
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

/// Empty guard = true. Evaluation failure is reported to the caller as an
/// `Err` so it can both raise `error.execution` *and* treat the guard as
/// false (§4.4 step 2); the expression is evaluated exactly once here and
/// never re-evaluated by a later stage.
fn eval_guard(model: &mut dyn Datamodel, session_id: &str, transition: &Transition) -> Result<bool, String> {
    match &transition.guard {
        None => Ok(true),
        Some(expr) => model
            .evaluate_expression(session_id, expr)
            .map(|v| truthy(&v))
            .map_err(|e| format!("guard '{expr}' failed: {e}")),
    }
}

/// The transition's *domain* (spec.md uses "lcca(source, target)" loosely;
/// this is the precise value, shared between exit-set computation here and
/// entry-set computation in `microstep`): `source` itself for a strict
/// internal transition (source and its ancestors remain active), else the
/// pairwise fold of [`hierarchy::lcca`] over source and every target.
pub fn transition_domain(doc: &Document, transition: &Transition) -> StateId {
    if is_strict_internal(doc, transition) {
        return transition.source;
    }
    let mut fold_states = vec![transition.source];
    fold_states.extend(transition.targets.iter().copied());
    hierarchy::lcca_of(doc, &fold_states)
}

/// §4.4 "Exit set computation", per `(source, target)`. Shared verbatim with
/// the microstep executor (§6), which only consumes the sets this module
/// already computed during selection — it never recomputes them.
pub fn compute_exit_set(doc: &Document, active: &HashSet<StateId>, transition: &Transition) -> Vec<StateId> {
    if transition.is_targetless() {
        return Vec::new();
    }

    if is_strict_internal(doc, transition) {
        let mut set = HashSet::new();
        for &target in &transition.targets {
            for s in hierarchy::exit_chain(doc, transition.source, target, active) {
                set.insert(s);
            }
        }
        return order_exit_set(doc, set);
    }

    let domain = transition_domain(doc, transition);

    let mut set: HashSet<StateId> = active
        .iter()
        .copied()
        .filter(|&s| hierarchy::is_descendant(doc, s, domain))
        .collect();

    // "Ancestor transition": the target coincides with the domain itself, so
    // the domain must also be exited (and re-entered) even though it is not
    // its own proper descendant.
    if transition.targets.contains(&domain) && active.contains(&domain) {
        set.insert(domain);
    }

    order_exit_set(doc, set)
}

fn order_exit_set(doc: &Document, set: HashSet<StateId>) -> Vec<StateId> {
    let mut v: Vec<StateId> = set.into_iter().collect();
    v.sort_by(|&a, &b| {
        let da = hierarchy::depth(doc, a);
        let db = hierarchy::depth(doc, b);
        db.cmp(&da).then_with(|| hierarchy::doc_order(doc, b).cmp(&hierarchy::doc_order(doc, a)))
    });
    v
}

/// One transition selected as a candidate, paired with its already-computed
/// exit set (conflict resolution needs the exit set to detect overlap).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub transition_id: TransitionId,
    pub exit_set: Vec<StateId>,
}

fn conflicts(doc: &Document, a: &Candidate, b: &Candidate) -> bool {
    if a.exit_set.iter().any(|x| b.exit_set.contains(x)) {
        return true;
    }
    let ta = doc.transition(a.transition_id);
    let tb = doc.transition(b.transition_id);
    if ta.targets.contains(&tb.source) || tb.targets.contains(&ta.source) {
        return true;
    }
    let exits_parallel_ancestor_of = |exit_set: &[StateId], other_source: StateId| {
        exit_set.iter().any(|&s| {
            matches!(doc.state(s).kind, StateKind::Parallel) && hierarchy::is_descendant(doc, other_source, s)
        })
    };
    exits_parallel_ancestor_of(&a.exit_set, tb.source) || exits_parallel_ancestor_of(&b.exit_set, ta.source)
}

/// Appendix D.2: apply in document order, maintaining a filtered set;
/// preempted transitions are removed as discovered. A transition whose
/// source is a proper descendant of a conflicting one's source preempts it;
/// otherwise the earlier-in-document-order transition (already in the
/// filtered set, since `candidates` arrives sorted) wins.
pub fn resolve_conflicts(doc: &Document, candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut filtered: Vec<Candidate> = Vec::new();
    'candidates: for candidate in candidates {
        let candidate_source = doc.transition(candidate.transition_id).source;
        let mut preempted = Vec::new();
        for (i, existing) in filtered.iter().enumerate() {
            if conflicts(doc, &candidate, existing) {
                let existing_source = doc.transition(existing.transition_id).source;
                if hierarchy::is_descendant(doc, candidate_source, existing_source) {
                    preempted.push(i);
                } else {
                    continue 'candidates;
                }
            }
        }
        for &i in preempted.iter().rev() {
            filtered.remove(i);
        }
        filtered.push(candidate);
    }
    filtered
}

/// §4.4 step 1: for each active atomic state, walk up to the root, collect
/// transitions in document order, stop after the first match+guard-true.
/// Active leaves are states in `active` none of whose children are also in
/// `active` (works uniformly for atomic states and the bottom of parallel
/// regions). Returns the conflict-resolved transition set in document
/// order, plus any `error.execution` events raised by failing guards.
pub fn select_transitions(
    doc: &Document,
    active: &HashSet<StateId>,
    event_name: Option<&str>,
    model: &mut dyn Datamodel,
    session_id: &str,
) -> (Vec<TransitionId>, Vec<Event>) {
    let mut errors = Vec::new();

    let mut leaves: Vec<StateId> = active
        .iter()
        .copied()
        .filter(|&s| !doc.state(s).children.iter().any(|c| active.contains(c)))
        .collect();
    leaves.sort_by_key(|&s| hierarchy::doc_order(doc, s));

    let mut seen: HashSet<TransitionId> = HashSet::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for leaf in leaves {
        let mut cursor = leaf;
        loop {
            let mut found = None;
            for &tid in &doc.state(cursor).transitions {
                let transition = doc.transition(tid);
                if !event_matches_transition(transition, event_name) {
                    continue;
                }
                match eval_guard(model, session_id, transition) {
                    Ok(true) => {
                        found = Some(tid);
                        break;
                    }
                    Ok(false) => continue,
                    Err(msg) => {
                        errors.push(Event::error_execution(msg));
                        continue;
                    }
                }
            }
            if let Some(tid) = found {
                if seen.insert(tid) {
                    let exit_set = compute_exit_set(doc, active, doc.transition(tid));
                    candidates.push(Candidate { transition_id: tid, exit_set });
                }
                break;
            }
            match doc.state(cursor).parent {
                Some(p) => cursor = p,
                None => break,
            }
        }
    }

    candidates.sort_by_key(|c| doc.transition(c.transition_id).doc_order);
    let resolved = resolve_conflicts(doc, candidates);
    (resolved.into_iter().map(|c| c.transition_id).collect(), errors)
}

/// Used by `select_transitions` callers that need the raw per-leaf/per-state
/// reachability without running full selection (e.g. diagnostics); kept
/// separate so the hot path above stays allocation-light.
pub fn active_leaves(doc: &Document, active: &HashSet<StateId>) -> Vec<StateId> {
    let mut leaves: HashMap<StateId, ()> = HashMap::new();
    for &s in active {
        if !doc.state(s).children.iter().any(|c| active.contains(c)) {
            leaves.insert(s, ());
        }
    }
    leaves.into_keys().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_matching_boundary_cases() {
        assert!(matches_event_descriptor("foo", "*"));
        assert!(matches_event_descriptor("foo", "foo"));
        assert!(matches_event_descriptor("foo.bar", "foo"));
        assert!(!matches_event_descriptor("foobar", "foo"));
        assert!(matches_event_descriptor("foo.bar", "foo.*"));
        assert!(matches_event_descriptor("bar", "foo bar"));
    }

    #[test]
    fn descriptor_wildcard_suffix_requires_the_dot() {
        assert!(!matches_event_descriptor("foobar", "foo.*"));
        assert!(!matches_event_descriptor("foo", "foo.*"));
        assert!(matches_event_descriptor("foo.bar", "foo.*"));
    }
}
