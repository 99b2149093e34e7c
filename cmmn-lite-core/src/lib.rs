//! Hierarchical case execution: a lifecycle state machine over a tree of
//! plan-item occurrences, with sentry-gated activation, cascade propagation,
//! listener dispatch, and an append-only audit log.

pub mod engine;
pub mod errors;
pub mod events;
pub mod listener;
pub mod sentry;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod variables;

pub use engine::CaseEngine;
pub use errors::{CaseError, CaseResult};
pub use events::CaseRuntimeEvent;
pub use listener::{
    CaseListener, ListenerContext, ListenerFailure, ListenerRegistry, MapListenerRegistry,
    NoListeners,
};
pub use store::CaseStore;
pub use store_memory::MemoryStore;
pub use types::{
    ActivationPolicy, CaseExecutionNode, CaseExecutionState, CaseInstance, CaseModel, ItemKind,
    PlanItemDefinition, Sentry, SentryDefinition, SentryKind, SentryPart, SentryPartDefinition,
    SuspensionOrigin, Transition,
};
