//! The active configuration (§3): the set of currently active state ids.
//! Mutated only by the microstep executor; session-private. Generalizes the
//! teacher's `StateMachine { active, active_leaves }` component (entity sets
//! on an ECS component) into plain owned state, since this crate has no
//! world to attach it to.

use std::collections::HashSet;

use crate::document::StateId;

#[derive(Debug, Default)]
pub struct Configuration {
    active: HashSet<StateId>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_active(&self, id: StateId) -> bool {
        self.active.contains(&id)
    }

    #[inline]
    pub fn active_states(&self) -> &HashSet<StateId> {
        &self.active
    }

    #[inline]
    pub fn insert(&mut self, id: StateId) {
        self.active.insert(id);
    }

    #[inline]
    pub fn remove(&mut self, id: StateId) {
        self.active.remove(&id);
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
