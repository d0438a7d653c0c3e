//! Planner error types.

use batchgrid_core::{BatchGroup, ModelError};
use thiserror::Error;

/// Errors that abort planning for one target for one pass.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("target has no extractable value: {0}")]
    NotExtractable(String),

    #[error("actor capability insufficient to extract from {0}")]
    InsufficientCapability(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("schedule infeasible: {group} would need to start {shortfall_ms}ms in the past")]
    ScheduleInfeasible { group: BatchGroup, shortfall_ms: u64 },
}

impl From<ModelError> for PlanError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidParameter(msg) => PlanError::InvalidParameter(msg),
        }
    }
}

pub type PlanResult<T> = Result<T, PlanError>;
