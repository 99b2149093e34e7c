use crate::types::{CaseExecutionState, Timestamp, Transition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every case instance.
/// Appended by the dispatcher at each observable step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CaseRuntimeEvent {
    CaseCreated {
        case_instance_id: Uuid,
        case_definition_key: String,
    },
    /// A plan-item occurrence entered the tree (state `Available`).
    PlanItemInstantiated {
        execution_id: Uuid,
        activity_id: String,
        parent_id: Option<Uuid>,
    },
    TransitionFired {
        execution_id: Uuid,
        activity_id: String,
        transition: Transition,
        from: CaseExecutionState,
        to: CaseExecutionState,
    },
    SentryPartSatisfied {
        sentry_id: String,
        part_id: String,
        source_execution_id: Uuid,
        standard_event: Transition,
    },
    /// All parts latched — the dependent transition is about to fire.
    SentrySatisfied {
        sentry_id: String,
        target_execution_id: Uuid,
    },
    /// A terminal occurrence left the tree. Its id may still appear in
    /// history but never re-enters.
    PlanItemEvicted {
        execution_id: Uuid,
        activity_id: String,
        outcome: CaseExecutionState,
    },
    /// A listener raised a domain fault; the structural change stays
    /// committed, remaining cascade steps were skipped.
    ListenerFaulted {
        execution_id: Uuid,
        transition: Transition,
        code: String,
        message: String,
    },
    CaseClosed {
        at: Timestamp,
    },
}
