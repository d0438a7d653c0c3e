//! Launch executor: turns an [`Allocation`] into running jobs.
//!
//! One job is started per `(host, group)` pair, carrying the group's start
//! delay from the cycle schedule. A failed launch is recorded against its
//! host and its threads are dropped for this pass; they are not moved to
//! another host, since a late reshuffle would skew the batch timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use batchgrid_core::{BatchGroup, HostId, JobHandle, OperationKind, TargetId};
use batchgrid_planner::CycleSchedule;

use crate::allocator::Allocation;

/// Why a single launch failed.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum LaunchError {
    #[error("host {host} lacks capacity: needed {needed}, free {free}")]
    InsufficientCapacity { host: HostId, needed: f64, free: f64 },

    #[error("worker payload missing on host {0}")]
    PayloadMissing(HostId),

    #[error("host unreachable: {0}")]
    HostUnreachable(HostId),

    #[error("launch rejected: {0}")]
    Rejected(String),
}

/// Parameters for one job launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub host_id: HostId,
    pub group: BatchGroup,
    pub kind: OperationKind,
    pub threads: u32,
    pub target_id: TargetId,
    pub start_delay: Duration,
    pub duration: Duration,
}

/// Process-launch collaborator.
pub trait JobLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<JobHandle, LaunchError>;
}

/// A job that started successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchedJob {
    pub handle: JobHandle,
    pub request: LaunchRequest,
}

impl LaunchedJob {
    /// Offset from launch at which this job's effect lands.
    pub fn lands_after(&self) -> Duration {
        self.request.start_delay + self.request.duration
    }
}

/// A launch that failed; its threads are not retried this pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchFailure {
    pub request: LaunchRequest,
    pub error: LaunchError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchReport {
    pub launched: Vec<LaunchedJob>,
    pub failures: Vec<LaunchFailure>,
}

impl LaunchReport {
    pub fn launched_threads(&self, group: BatchGroup) -> u32 {
        self.launched
            .iter()
            .filter(|j| j.request.group == group)
            .map(|j| j.request.threads)
            .sum()
    }

    pub fn total_launched_threads(&self) -> u64 {
        self.launched.iter().map(|j| u64::from(j.request.threads)).sum()
    }

    /// Hosts with at least one failed launch, sorted and deduplicated.
    pub fn failed_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.failures.iter().map(|f| f.request.host_id.clone()).collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Hosts that launched everything they were asked to.
    pub fn succeeded_hosts(&self) -> Vec<HostId> {
        let failed = self.failed_hosts();
        let mut hosts: Vec<HostId> = self
            .launched
            .iter()
            .map(|j| j.request.host_id.clone())
            .filter(|h| !failed.contains(h))
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

/// Launch every assignment in `allocation` with the delays from `schedule`.
pub fn execute<L: JobLauncher + ?Sized>(
    allocation: &Allocation,
    schedule: &CycleSchedule,
    launcher: &L,
) -> LaunchReport {
    let mut report = LaunchReport::default();

    for (host_id, group, threads) in allocation.assignments() {
        if threads == 0 {
            continue;
        }
        let Some(timing) = schedule.timing(group) else {
            continue;
        };
        let request = LaunchRequest {
            host_id: host_id.clone(),
            group,
            kind: group.kind(),
            threads,
            target_id: allocation.target_id.clone(),
            start_delay: timing.start_delay,
            duration: timing.duration,
        };

        match launcher.launch(&request) {
            Ok(handle) => {
                debug!(
                    host = %request.host_id,
                    %group,
                    threads,
                    %handle,
                    delay_ms = request.start_delay.as_millis() as u64,
                    "job launched"
                );
                report.launched.push(LaunchedJob { handle, request });
            }
            Err(error) => {
                warn!(
                    host = %request.host_id,
                    %group,
                    threads,
                    error = %error,
                    "job launch failed"
                );
                report.failures.push(LaunchFailure { request, error });
            }
        }
    }

    info!(
        target = %allocation.target_id,
        jobs = report.launched.len(),
        threads = report.total_launched_threads(),
        failures = report.failures.len(),
        "batch launched"
    );
    report
}
