//! Error taxonomy shared by every component.
//!
//! Only `InvalidTransition`, `NotFound`, `InvalidSpec` and `AdmissionRejected`
//! are ever surfaced to a plan requester. The rest are internal: the monitor
//! loop logs them, skips the affected stage for the current tick and moves on.

use thiserror::Error;

use crate::plan::{PlanId, PlanState};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("plan {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: PlanId,
        from: PlanState,
        to: PlanState,
    },

    #[error("plan {id}: stale revision (expected {expected}, found {found})")]
    StaleRevision { id: PlanId, expected: u64, found: u64 },

    #[error("{collaborator} unavailable: {detail}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        detail: String,
    },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("execution rejected for plan {id}: {detail}")]
    ExecutionRejected { id: PlanId, detail: String },

    #[error("plan {0} not found")]
    NotFound(PlanId),

    #[error("invalid plan spec: {0}")]
    InvalidSpec(String),

    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),
}

impl PlanError {
    pub fn collaborator(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        PlanError::CollaboratorUnavailable {
            collaborator,
            detail: err.to_string(),
        }
    }

    /// Short stable tag used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanError::InvalidTransition { .. } => "invalid_transition",
            PlanError::StaleRevision { .. } => "stale_revision",
            PlanError::CollaboratorUnavailable { .. } => "collaborator_unavailable",
            PlanError::BudgetExceeded(_) => "budget_exceeded",
            PlanError::ExecutionRejected { .. } => "execution_rejected",
            PlanError::NotFound(_) => "not_found",
            PlanError::InvalidSpec(_) => "invalid_spec",
            PlanError::AdmissionRejected(_) => "admission_rejected",
            PlanError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, PlanError::StaleRevision { .. })
    }
}

impl From<rusqlite::Error> for PlanError {
    fn from(err: rusqlite::Error) -> Self {
        PlanError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for PlanError {
    fn from(err: serde_json::Error) -> Self {
        PlanError::StoreUnavailable(format!("codec: {}", err))
    }
}

pub type PlanResult<T> = Result<T, PlanError>;
