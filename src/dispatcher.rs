//! External communications (C10.6.3) — [MODULE: dispatcher].
//!
//! `<send>` to anything other than `#_internal`/`#_parent` is delegated
//! through this trait (§4.5.2, §6.3). Out of scope as a concrete transport
//! (HTTP, in-process pipes are external collaborators per §1); the core only
//! owns the interface shape and the "no transport wired up" default.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct DispatchError(pub String);

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// One resolved `<send>` ready for delivery: target/event already resolved
/// from `targetexpr`/`eventexpr` by the caller, params/namelist already
/// flattened into `data` by the caller (§6.3: "structured objects flattened
/// to key/value pairs" happens at the dispatcher boundary, not here, since
/// flattening rules are transport-specific).
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub sendid: &'a str,
    pub target: &'a str,
    pub event: &'a str,
    pub data: Value,
    pub delay_ms: u64,
    pub type_: Option<&'a str>,
}

/// Host-provided event transport (§6.3). Asynchronous in general: `send`
/// schedules or delivers and may return before a response is known; a
/// response surfaces later as an external event on the session's queue
/// through whatever ingress the host wires up, not as this call's return
/// value.
pub trait EventDispatcher {
    fn send(&mut self, request: DispatchRequest<'_>) -> Result<(), DispatchError>;

    /// Cancel a scheduled delayed send by its `sendid` (§4.5.2 `cancel`).
    fn cancel(&mut self, sendid: &str);
}

/// "No transport wired up" default (mirrors [`crate::datamodel::NullDatamodel`]):
/// every send fails with a communication error; cancel is a no-op since
/// nothing could have been scheduled.
#[derive(Debug, Default)]
pub struct NullDispatcher;

impl EventDispatcher for NullDispatcher {
    fn send(&mut self, request: DispatchRequest<'_>) -> Result<(), DispatchError> {
        Err(DispatchError(format!(
            "no event dispatcher configured: cannot send '{}' to '{}'",
            request.event, request.target
        )))
    }

    fn cancel(&mut self, _sendid: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_dispatcher_always_fails() {
        let mut d = NullDispatcher;
        let result = d.send(DispatchRequest {
            sendid: "s1",
            target: "http://example.com",
            event: "foo",
            data: Value::Null,
            delay_ms: 0,
            type_: None,
        });
        assert!(result.is_err());
    }
}
