//! Execution core of a W3C SCXML 1.0 interpreter: the macrostep/microstep
//! engine described in `spec.md`/`SPEC_FULL.md` — active-configuration
//! bookkeeping, transition selection, the microstep executor, the event
//! queues, the scripting/data-model host interface, the invoke lifecycle,
//! and history. XML parsing, a concrete scripting engine, and concrete event
//! transports are external collaborators (`Datamodel`, `EventDispatcher`,
//! `ChildSessionFactory`) that a host plugs in; this crate ships working
//! no-op defaults (`NullDatamodel`, `NullDispatcher`,
//! `NullChildSessionFactory`) for each so the control-flow skeleton of a
//! chart can be exercised before any of them are wired up.
//!
//! Module map (component IDs refer to `spec.md` §2):
//! - [`document`] — C1, the read-only state/transition graph (`Document`,
//!   `DocumentBuilder`, `StateId`/`TransitionId`).
//! - [`hierarchy`] — C4, pure ancestor/descendant/LCCA/entry-exit-chain
//!   functions over a `Document`.
//! - [`history`] — C5, the shallow/deep history store.
//! - [`queue`] — C3, the internal/external event FIFOs and immediate mode.
//! - [`transitions`] — C6, event matching, guard evaluation, conflict
//!   resolution.
//! - [`microstep`] — C7, exit → actions → entry for one resolved transition
//!   set.
//! - [`macrostep`] — C8, the eventless/internal/external completion loop.
//! - [`invoke`] — C9, invoke deferral, execution, cancellation, routing.
//! - [`datamodel`] — C2, the scripting host trait plus binding-mode
//!   initialisation and donedata construction.
//! - [`dispatcher`] — the `<send>` external-transport trait.
//! - [`session`] — C10, the host-facing facade tying all of the above
//!   together for one chart.

pub mod configuration;
pub mod datamodel;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod hierarchy;
pub mod history;
pub mod invoke;
pub mod macrostep;
pub mod microstep;
pub mod prelude;
pub mod queue;
pub mod session;
pub mod transitions;

pub use configuration::Configuration;
pub use document::{Document, DocumentBuilder, StateId, TransitionId};
pub use error::SessionError;
pub use history::HistoryStore;
pub use queue::{Event, EventQueues, EventType};
pub use session::Session;
