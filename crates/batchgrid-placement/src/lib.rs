//! batchgrid-placement: maps a batch's thread counts onto worker hosts.
//!
//! This crate decides which hosts run how many threads of each group and
//! hands the result to a launch collaborator. It does NOT track host
//! health across passes (that's `batchgrid-supervisor`).
//!
//! # Components
//!
//! - **`allocator`**: Greedy largest-free-host allocation per group
//! - **`executor`**: Launches allocated jobs with their start delays

pub mod allocator;
pub mod executor;

pub use allocator::{Allocation, FreeCapacity, GroupAllocation, allocate};
pub use executor::{JobLauncher, LaunchError, LaunchFailure, LaunchReport, LaunchRequest, LaunchedJob, execute};
