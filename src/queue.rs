//! Event Raiser & Queues (C3): the internal/external FIFO pair plus the
//! immediate-mode flag that gates synchronous raise-and-run (§4.3). Mirrors
//! the original source's `EventQueueManager` / `ImmediateModeGuard` split,
//! generalized from a raw-pointer-guarded singleton into session-private,
//! plain-owned state.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Event::type_` discriminant (§3 "Event (runtime)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Platform,
    Internal,
    External,
}

/// An immutable, already-enqueued event. Constructed once and never mutated
/// (§3: "Events are immutable once enqueued"). `Serialize`/`Deserialize` let
/// a host hand these across its own transport boundary (§6.3) or log them
/// structurally without this crate committing to a wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub type_: EventType,
    pub sendid: Option<String>,
    pub invokeid: Option<String>,
    pub origin: Option<String>,
    pub origintype: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, type_: EventType) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            type_,
            sendid: None,
            invokeid: None,
            origin: None,
            origintype: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_sendid(mut self, sendid: impl Into<String>) -> Self {
        self.sendid = Some(sendid.into());
        self
    }

    pub fn with_invokeid(mut self, invokeid: impl Into<String>) -> Self {
        self.invokeid = Some(invokeid.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_origintype(mut self, origintype: impl Into<String>) -> Self {
        self.origintype = Some(origintype.into());
        self
    }

    /// §6.5 / §7: raised internally on guard/action/expression failure.
    /// Tagged `Platform` so §4.7's auto-forward filter exempts it.
    pub fn error_execution(detail: impl Into<String>) -> Self {
        Self::new("error.execution", EventType::Platform).with_data(Value::String(detail.into()))
    }

    /// §6.5 / §7: raised internally on `<send>` delivery failure.
    pub fn error_communication(detail: impl Into<String>) -> Self {
        Self::new("error.communication", EventType::Platform).with_data(Value::String(detail.into()))
    }

    pub fn done_state(state_sid: &str) -> Self {
        Self::new(format!("done.state.{state_sid}"), EventType::Platform)
    }

    pub fn done_invoke(invokeid: &str) -> Self {
        Self::new(format!("done.invoke.{invokeid}"), EventType::Platform)
    }

    /// Platform events (`done.*`, `error.*`) are never auto-forwarded (§4.7 step 3).
    pub fn is_platform(&self) -> bool {
        matches!(self.type_, EventType::Platform)
    }
}

/// The internal-high-priority / external-low-priority FIFO pair (§4.3).
/// Enqueue never blocks; dequeue only happens from the macrostep driver on
/// the session-owning executor (§5: single-threaded cooperative executor).
#[derive(Debug, Default)]
pub struct EventQueues {
    internal: VecDeque<Event>,
    external: VecDeque<Event>,
    immediate_mode: bool,
}

impl EventQueues {
    pub fn new() -> Self {
        Self {
            internal: VecDeque::new(),
            external: VecDeque::new(),
            // Quiescence (macrostep boundary) is the "on" state; the driver
            // flips it off for the duration of block/transition action
            // execution (§4.3).
            immediate_mode: true,
        }
    }

    pub fn raise_internal(&mut self, event: Event) {
        self.internal.push_back(event);
    }

    pub fn raise_external(&mut self, event: Event) {
        self.external.push_back(event);
    }

    pub fn pop_internal(&mut self) -> Option<Event> {
        self.internal.pop_front()
    }

    pub fn pop_external(&mut self) -> Option<Event> {
        self.external.pop_front()
    }

    pub fn has_internal(&self) -> bool {
        !self.internal.is_empty()
    }

    pub fn has_external(&self) -> bool {
        !self.external.is_empty()
    }

    pub fn is_immediate_mode(&self) -> bool {
        self.immediate_mode
    }

    pub fn set_immediate_mode(&mut self, enabled: bool) {
        self.immediate_mode = enabled;
    }

    /// Dequeue priority per P4/§5: internal is strict priority — if any
    /// internal event is pending, the external queue is not even inspected.
    pub fn pop_next(&mut self) -> Option<Event> {
        self.pop_internal().or_else(|| self.pop_external())
    }
}

/// RAII guard that turns immediate mode off for the duration of
/// block/transition action execution and restores whatever value was there
/// before, regardless of unwind path (§4.3: "Restoration uses a scoped guard
/// so any failure or early return restores the prior value").
///
/// `EventQueues` is not `Send`/shareable across an `&mut` borrow boundary the
/// way the original's `shared_ptr<IEventRaiser>` is, so this guard borrows
/// it directly rather than holding a handle.
pub struct ImmediateModeGuard<'a> {
    queues: &'a mut EventQueues,
    previous: bool,
}

impl<'a> ImmediateModeGuard<'a> {
    pub fn new(queues: &'a mut EventQueues, enabled: bool) -> Self {
        let previous = queues.is_immediate_mode();
        queues.set_immediate_mode(enabled);
        Self { queues, previous }
    }
}

impl Drop for ImmediateModeGuard<'_> {
    fn drop(&mut self) {
        self.queues.set_immediate_mode(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_drains_before_external() {
        let mut q = EventQueues::new();
        q.raise_external(Event::new("ext", EventType::External));
        q.raise_internal(Event::new("int", EventType::Internal));
        assert_eq!(q.pop_next().unwrap().name, "int");
        assert_eq!(q.pop_next().unwrap().name, "ext");
    }

    #[test]
    fn immediate_mode_guard_restores_on_drop() {
        let mut q = EventQueues::new();
        assert!(q.is_immediate_mode());
        {
            let _guard = ImmediateModeGuard::new(&mut q, false);
            assert!(!q.is_immediate_mode());
        }
        assert!(q.is_immediate_mode());
    }

    #[test]
    fn platform_events_are_never_forwardable() {
        assert!(Event::error_execution("boom").is_platform());
        assert!(Event::done_state("x").is_platform());
        assert!(!Event::new("foo", EventType::External).is_platform());
    }
}
