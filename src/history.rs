//! History Store (C5): records the most recent set of active descendants for
//! every history pseudo-state, and restores them on re-entry. Generalizes
//! the teacher's per-entity `HistoryState(HashSet<Entity>)` component into a
//! session-private map keyed by the history node's id, since this crate has
//! no ECS world to attach components to.

use std::collections::{HashMap, HashSet};

use crate::document::{Document, HistoryType, StateId, StateKind};

#[derive(Debug, Default)]
pub struct HistoryStore {
    recorded: HashMap<StateId, HashSet<StateId>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all recorded history (§3 "Lifecycle": persists across
    /// re-entries until cleared by explicit reset).
    pub fn reset(&mut self) {
        self.recorded.clear();
    }

    /// For every history child of `state_id`, capture the relevant subset of
    /// `active` (shallow: direct children on the path to each active leaf;
    /// deep: every active descendant). Must be called before onexit actions
    /// run for `state_id` (I5).
    pub fn record(&mut self, doc: &Document, state_id: StateId, active: &HashSet<StateId>) {
        let history_children: Vec<StateId> = doc
            .state(state_id)
            .children
            .iter()
            .copied()
            .filter(|&c| doc.state(c).is_history())
            .collect();

        for history_child in history_children {
            let history_type = match doc.state(history_child).kind {
                StateKind::History(t) => t,
                _ => unreachable!(),
            };
            let snapshot = match history_type {
                HistoryType::Shallow => {
                    let mut saved = HashSet::new();
                    for &leaf in active {
                        if let Some(direct_child) = immediate_child_on_path(doc, state_id, leaf, active) {
                            saved.insert(direct_child);
                        }
                    }
                    saved
                }
                HistoryType::Deep => active
                    .iter()
                    .copied()
                    .filter(|&s| s != state_id && crate::hierarchy::is_descendant(doc, s, state_id))
                    .collect(),
            };
            self.recorded.insert(history_child, snapshot);
        }
    }

    /// Returns `(targets, was_restored)`. `was_restored = false` means the
    /// history node's own default-transition targets are used instead (W3C
    /// 3.10: only run the default transition's executable content when
    /// there was no recording).
    pub fn restore(&self, doc: &Document, history_id: StateId) -> (Vec<StateId>, bool) {
        match self.recorded.get(&history_id) {
            Some(set) if !set.is_empty() => (set.iter().copied().collect(), true),
            _ => (doc.state(history_id).initial.clone(), false),
        }
    }

    /// If any history child of `compound_id` has a recording, return that
    /// recording's targets; otherwise the static initial child(ren).
    pub fn initial_or_history_child(&self, doc: &Document, compound_id: StateId) -> Vec<StateId> {
        for &child in &doc.state(compound_id).children {
            if doc.state(child).is_history() {
                if let Some(set) = self.recorded.get(&child) {
                    if !set.is_empty() {
                        return set.iter().copied().collect();
                    }
                }
            }
        }
        doc.state(compound_id).initial.clone()
    }
}

/// Walk up from `leaf` toward `ancestor`; return the child of `ancestor`
/// that sits directly on that path, if `leaf` is indeed in `active` and
/// descends from `ancestor`.
fn immediate_child_on_path(
    doc: &Document,
    ancestor: StateId,
    leaf: StateId,
    active: &HashSet<StateId>,
) -> Option<StateId> {
    if !active.contains(&leaf) {
        return None;
    }
    let mut prev = leaf;
    let mut cursor = leaf;
    while let Some(p) = doc.state(cursor).parent {
        if p == ancestor {
            return Some(prev);
        }
        prev = p;
        cursor = p;
    }
    None
}
