//! Scenario tests seeding the suite (SPEC_FULL.md / spec.md §8), one
//! `#[test]` per scenario, asserting on the literal active-state set after
//! each call the way the teacher's `tests/state_machine_tests.rs` does.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use scxml_core::document::{Action, DoneData, HistoryType, Param, StateKind, TransitionKind};
use scxml_core::{Document, DocumentBuilder, Session};
use serde_json::Value;

fn build(doc: DocumentBuilder) -> Document {
    doc.build().expect("document should build")
}

/// 1. Simple transition: `a` (initial) -> `b` on `e`.
#[test]
fn simple_transition() {
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["a"], vec![], vec![], vec![], vec![], None)
            .state("a", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .state("b", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("a", vec!["e"], None, vec!["b"], TransitionKind::External, vec![]),
    );
    let mut session = Session::load_model(Arc::new(doc), "t1");
    session.start().unwrap();
    assert_eq!(session.active_states(), ["root", "a"].into_iter().collect());

    session.send("e", Value::Null).unwrap();
    assert_eq!(session.active_states(), ["root", "b"].into_iter().collect());
}

/// 2. Internal vs external self-transition: a compound `c`'s onentry/onexit
/// must not refire for an internal self-transition but must for an external
/// one, even when the target is the already-active child.
#[test]
fn internal_self_transition_does_not_refire_compound_onentry_onexit() {
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["c"], vec![], vec![], vec![], vec![], None)
            .state(
                "c",
                StateKind::Compound,
                Some("root"),
                vec!["a"],
                vec![vec![Action::Raise { event: "c_entered".into() }]],
                vec![vec![Action::Raise { event: "c_exited".into() }]],
                vec![],
                vec![],
                None,
            )
            .state("a", StateKind::Atomic, Some("c"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("c", vec!["e"], None, vec!["a"], TransitionKind::Internal, vec![]),
    );
    let raised = Rc::new(RefCell::new(Vec::new()));
    let sink = raised.clone();
    let mut session = Session::load_model(Arc::new(doc), "t2a");
    session.set_event_raiser(Box::new(move |name, _data| sink.borrow_mut().push(name.to_string())));
    session.start().unwrap();
    assert_eq!(*raised.borrow(), vec!["c_entered".to_string()]);

    session.send("e", Value::Null).unwrap();
    assert_eq!(*raised.borrow(), vec!["c_entered".to_string()]);
    assert_eq!(session.active_states(), ["root", "c", "a"].into_iter().collect());
}

#[test]
fn external_self_transition_refires_compound_onentry_onexit() {
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["c"], vec![], vec![], vec![], vec![], None)
            .state(
                "c",
                StateKind::Compound,
                Some("root"),
                vec!["a"],
                vec![vec![Action::Raise { event: "c_entered".into() }]],
                vec![vec![Action::Raise { event: "c_exited".into() }]],
                vec![],
                vec![],
                None,
            )
            .state("a", StateKind::Atomic, Some("c"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("c", vec!["e"], None, vec!["a"], TransitionKind::External, vec![]),
    );
    let raised = Rc::new(RefCell::new(Vec::new()));
    let sink = raised.clone();
    let mut session = Session::load_model(Arc::new(doc), "t2b");
    session.set_event_raiser(Box::new(move |name, _data| sink.borrow_mut().push(name.to_string())));
    session.start().unwrap();
    assert_eq!(*raised.borrow(), vec!["c_entered".to_string()]);

    session.send("e", Value::Null).unwrap();
    assert_eq!(
        *raised.borrow(),
        vec!["c_entered".to_string(), "c_exited".to_string(), "c_entered".to_string()]
    );
    assert_eq!(session.active_states(), ["root", "c", "a"].into_iter().collect());
}

/// 2b. Ancestor transition: a state transitions directly to itself (domain ==
/// target). The state must stay active and its `onentry` must fire again —
/// exiting it without re-entering would drop it from the configuration
/// outright.
#[test]
fn self_transition_to_self_reenters_and_refires_onentry() {
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["a"], vec![], vec![], vec![], vec![], None)
            .state(
                "a",
                StateKind::Atomic,
                Some("root"),
                vec![],
                vec![vec![Action::Raise { event: "a_entered".into() }]],
                vec![],
                vec![],
                vec![],
                None,
            )
            .transition("a", vec!["e"], None, vec!["a"], TransitionKind::External, vec![]),
    );
    let raised = Rc::new(RefCell::new(Vec::new()));
    let sink = raised.clone();
    let mut session = Session::load_model(Arc::new(doc), "t2c");
    session.set_event_raiser(Box::new(move |name, _data| sink.borrow_mut().push(name.to_string())));
    session.start().unwrap();
    assert_eq!(*raised.borrow(), vec!["a_entered".to_string()]);
    assert_eq!(session.active_states(), ["root", "a"].into_iter().collect());

    session.send("e", Value::Null).unwrap();
    assert_eq!(*raised.borrow(), vec!["a_entered".to_string(), "a_entered".to_string()]);
    assert_eq!(session.active_states(), ["root", "a"].into_iter().collect());
}

/// 3. Parallel join: region `r1`/`r2` each reach their own final on their own
/// event; the second arrival emits `done.state.P` and drives the waiting
/// transition out of the parallel entirely.
#[test]
fn parallel_join_emits_done_state_and_exits() {
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["p"], vec![], vec![], vec![], vec![], None)
            .state("p", StateKind::Parallel, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .state("r1", StateKind::Compound, Some("p"), vec!["r1a"], vec![], vec![], vec![], vec![], None)
            .state("r1a", StateKind::Atomic, Some("r1"), vec![], vec![], vec![], vec![], vec![], None)
            .state("r1f", StateKind::Final, Some("r1"), vec![], vec![], vec![], vec![], vec![], None)
            .state("r2", StateKind::Compound, Some("p"), vec!["r2a"], vec![], vec![], vec![], vec![], None)
            .state("r2a", StateKind::Atomic, Some("r2"), vec![], vec![], vec![], vec![], vec![], None)
            .state("r2f", StateKind::Final, Some("r2"), vec![], vec![], vec![], vec![], vec![], None)
            .state("done_state", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("r1a", vec!["e1"], None, vec!["r1f"], TransitionKind::External, vec![])
            .transition("r2a", vec!["e2"], None, vec!["r2f"], TransitionKind::External, vec![])
            .transition("root", vec!["done.state.p"], None, vec!["done_state"], TransitionKind::External, vec![]),
    );
    let mut session = Session::load_model(Arc::new(doc), "t3");
    session.start().unwrap();
    assert_eq!(
        session.active_states(),
        ["root", "p", "r1", "r1a", "r2", "r2a"].into_iter().collect()
    );

    session.send("e1", Value::Null).unwrap();
    assert_eq!(
        session.active_states(),
        ["root", "p", "r1", "r1f", "r2", "r2a"].into_iter().collect()
    );

    session.send("e2", Value::Null).unwrap();
    assert_eq!(session.active_states(), ["root", "done_state"].into_iter().collect());
}

/// 4. Eventless chain with internal event: `a`'s onentry raises `e1`,
/// `a --e1--> b`, then `b` has an eventless transition straight to `c` — all
/// settling before `start()` returns, with no external send at all.
#[test]
fn eventless_chain_with_internal_event_settles_on_start() {
    let doc = build(
        DocumentBuilder::new()
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
            .transition("b", vec![], None, vec!["c"], TransitionKind::External, vec![]),
    );
    let mut session = Session::load_model(Arc::new(doc), "t4");
    session.start().unwrap();
    assert_eq!(session.active_states(), ["root", "c"].into_iter().collect());
}

/// 5. Shallow history: enter `c/x`, leave to sibling `z`, come back through
/// `c`'s history child — lands exactly back on `x`, not on `c`'s own
/// `initial` default.
#[test]
fn shallow_history_round_trip() {
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["c"], vec![], vec![], vec![], vec![], None)
            .state(
                "c",
                StateKind::Compound,
                Some("root"),
                vec!["x"],
                vec![],
                vec![],
                vec![],
                vec![],
                None,
            )
            .state("x", StateKind::Atomic, Some("c"), vec![], vec![], vec![], vec![], vec![], None)
            .state("y", StateKind::Atomic, Some("c"), vec![], vec![], vec![], vec![], vec![], None)
            .state(
                "h",
                StateKind::History(HistoryType::Shallow),
                Some("c"),
                vec!["x"],
                vec![],
                vec![],
                vec![],
                vec![],
                None,
            )
            .state("z", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("x", vec!["out"], None, vec!["z"], TransitionKind::External, vec![])
            .transition("z", vec!["back"], None, vec!["h"], TransitionKind::External, vec![]),
    );
    let mut session = Session::load_model(Arc::new(doc), "t5");
    session.start().unwrap();
    assert_eq!(session.active_states(), ["root", "c", "x"].into_iter().collect());

    session.send("out", Value::Null).unwrap();
    assert_eq!(session.active_states(), ["root", "z"].into_iter().collect());

    session.send("back", Value::Null).unwrap();
    assert_eq!(session.active_states(), ["root", "c", "x"].into_iter().collect());
}

/// 6. Donedata structural error: a `<final>` with `<param location="">`
/// raises `error.execution` and suppresses `done.state.*` outright. Observed
/// indirectly — whichever sibling transition fires tells us which event the
/// session actually raised.
#[test]
fn donedata_empty_location_suppresses_done_state() {
    let donedata = DoneData {
        content: None,
        params: vec![Param { name: "p".into(), location: String::new(), expr: None }],
    };
    let doc = build(
        DocumentBuilder::new()
            .state("root", StateKind::Compound, None, vec!["outer"], vec![], vec![], vec![], vec![], None)
            .state("outer", StateKind::Compound, Some("root"), vec!["final1"], vec![], vec![], vec![], vec![], None)
            .state("final1", StateKind::Final, Some("outer"), vec![], vec![], vec![], vec![], vec![], Some(donedata))
            .state("error_seen", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .state("done_seen", StateKind::Atomic, Some("root"), vec![], vec![], vec![], vec![], vec![], None)
            .transition("root", vec!["error.execution"], None, vec!["error_seen"], TransitionKind::External, vec![])
            .transition("root", vec!["done.state.outer"], None, vec!["done_seen"], TransitionKind::External, vec![]),
    );
    let mut session = Session::load_model(Arc::new(doc), "t6");
    session.start().unwrap();
    assert_eq!(session.active_states(), ["root", "error_seen"].into_iter().collect());
}
