use thiserror::Error;

use batchgrid_core::{ConfigError, TargetId};
use batchgrid_planner::PlanError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("pass for {target_id} aborted: {source}")]
    Plan {
        target_id: TargetId,
        #[source]
        source: PlanError,
    },
}

impl ControllerError {
    /// Planner error behind a per-target abort, if that is what this is.
    pub fn plan_error(&self) -> Option<&PlanError> {
        match self {
            Self::Plan { source, .. } => Some(source),
            Self::Config(_) => None,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
