//! batchgrid-controller: the long-lived control loop.
//!
//! Ties the planner, allocator and supervisor together against a fleet of
//! external collaborators.
//!
//! - **`fleet`**: collaborator traits (hosts, targets, capacity, inventory)
//! - **`cache`**: host list refreshed once per pass
//! - **`controller`**: reconcile, plan, schedule, allocate, launch, sleep
//! - **`outcome`**: per-pass outcome records and their bounded history
//! - **`sim`**: in-memory fleet for tests and dry runs

pub mod cache;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod outcome;
pub mod sim;

pub use cache::HostCache;
pub use controller::{Controller, CycleReport};
pub use error::{ControllerError, ControllerResult};
pub use fleet::{CapacitySource, Fleet, HostDirectory, JobInventory, TargetPolicy, TargetSource};
pub use outcome::{GroupOutcome, OutcomeLog, PassOutcome};
pub use sim::{SimFleet, SimHost};
