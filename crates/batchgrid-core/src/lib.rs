//! batchgrid-core: shared types for the batch engine.
//!
//! - **`types`**: target snapshots, operation kinds, host capacity, job records
//! - **`model`**: per-kind duration and effect formulas behind [`OperationModel`]
//! - **`config`**: `BatchConfig` with TOML loading and duration strings

pub mod config;
pub mod model;
pub mod types;

pub use config::{BatchConfig, ConfigError, ReservePolicy, SchedulePolicy, ThreadCost, parse_duration};
pub use model::{ConstantModel, FormulaModel, ModelError, ModelResult, OperationModel};
pub use types::*;
