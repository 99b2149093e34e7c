use crate::types::{CaseExecutionState, Transition};
use uuid::Uuid;

/// Errors surfaced by the case engine.
///
/// `NotAllowed` and `NotFound` are always recoverable by the caller and never
/// retried automatically. A `DomainFault` propagates past the transition
/// boundary *without* rolling back the state change already applied; a
/// `FatalListener` aborts the transition, leaving state unchanged.
#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error("transition {transition} is not allowed in state {state}")]
    NotAllowed {
        transition: Transition,
        state: CaseExecutionState,
    },

    #[error("case execution {0} not found")]
    NotFound(Uuid),

    #[error("domain fault {code}: {message}")]
    DomainFault { code: String, message: String },

    #[error("listener failed during {transition}")]
    FatalListener {
        transition: Transition,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid case model: {0}")]
    InvalidModel(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type CaseResult<T> = Result<T, CaseError>;
