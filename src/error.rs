//! The fatal half of the error taxonomy in §7: conditions that surface
//! synchronously to the caller rather than as an `error.execution` /
//! `error.communication` event on the internal queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("top-level script failed during load: {0}")]
    TopLevelScriptFailed(String),

    #[error("macrostep exceeded its iteration cap ({0} iterations)")]
    IterationOverflow(usize),

    #[error("session is not running")]
    NotRunning,
}
