//! Collaborator traits the control loop consumes.
//!
//! Each trait covers one external concern (host enumeration, target state,
//! capacity, process inventory). Launching goes through
//! [`batchgrid_placement::JobLauncher`]. A type that implements all of them
//! is a [`Fleet`].

use serde::{Deserialize, Serialize};

use batchgrid_core::{ActorCapability, HostCapacity, HostId, JobHandle, JobInfo, TargetId, TargetSnapshot};
use batchgrid_placement::JobLauncher;
use batchgrid_planner::PlanResult;

/// Which chooser a target comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPolicy {
    /// Maximize extracted value.
    Value,
    /// Maximize throughput of completed operations.
    Throughput,
}

/// Network enumeration plus the access check.
pub trait HostDirectory {
    fn list_hosts(&self) -> Vec<HostId>;
    fn has_access(&self, host_id: &str) -> bool;
}

/// Target state, target selection and the actor's own capability.
pub trait TargetSource {
    /// Fresh snapshot. Fails with `PlanError::UnknownTarget` when the target
    /// is gone or unreachable.
    fn snapshot(&self, target_id: &str) -> PlanResult<TargetSnapshot>;

    fn choose_target(&self, policy: TargetPolicy) -> Option<TargetId>;

    fn actor_capability(&self) -> ActorCapability;
}

pub trait CapacitySource {
    /// `None` when the host no longer exists.
    fn host_capacity(&self, host_id: &str) -> Option<HostCapacity>;
}

/// Process inventory.
pub trait JobInventory {
    fn list_running_jobs(&self, host_id: &str) -> Vec<JobInfo>;
    /// Returns false if the job was already gone.
    fn kill(&self, handle: JobHandle) -> bool;
    fn has_payload(&self, host_id: &str) -> bool;
}

/// Everything the control loop talks to.
pub trait Fleet: HostDirectory + TargetSource + CapacitySource + JobInventory + JobLauncher {}

impl<T> Fleet for T where T: HostDirectory + TargetSource + CapacitySource + JobInventory + JobLauncher {}
