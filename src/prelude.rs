//! Convenience re-exports for host crates embedding a [`crate::Session`].
//! Mirrors the teacher's own `prelude` module, which exists for the same
//! reason: callers outside this crate want the common types without
//! spelling out every submodule path.

pub use crate::configuration::Configuration;
pub use crate::datamodel::{Datamodel, DatamodelError, IoProcessorDescriptor, NullDatamodel};
pub use crate::dispatcher::{DispatchError, DispatchRequest, EventDispatcher, NullDispatcher};
pub use crate::document::{
    Action, BindingMode, Document, DocumentBuilder, DoneData, HistoryType, InvokeDecl, Param,
    StateId, StateKind, Transition, TransitionId, TransitionKind,
};
pub use crate::error::SessionError;
pub use crate::history::HistoryStore;
pub use crate::invoke::{ChildHandle, ChildSessionFactory, InvokeManager, NullChildSessionFactory};
pub use crate::queue::{Event, EventQueues, EventType};
pub use crate::session::{Session, SessionChildFactory, SessionChildHandle};
