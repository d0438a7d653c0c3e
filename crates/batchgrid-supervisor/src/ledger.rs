//! Outstanding-job ledger and reconciliation.
//!
//! The control loop records every job it launches. Before each allocation
//! pass the ledger is reconciled against what the inventory collaborator
//! reports as running, host by host:
//!
//! - ledger entries no longer running are pruned (they finished)
//! - all running jobs on a host whose worker payload is missing are torn down
//! - jobs launched when a host was smaller than it is now are torn down,
//!   so the next pass can use the added capacity
//! - running jobs whose `(target, kind)` is not in the current plan are torn down

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use tracing::{debug, info};

use batchgrid_core::{BatchGroup, HostId, JobHandle, JobInfo, OperationKind, TargetId};

/// Capacity growth below this is treated as measurement noise.
const CAPACITY_EPSILON: f64 = 1e-9;

/// A job this controller launched and has not yet seen finish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingJob {
    pub handle: JobHandle,
    pub host_id: HostId,
    pub group: BatchGroup,
    pub kind: OperationKind,
    pub target_id: TargetId,
    pub threads: u32,
    /// Host's maximum capacity when the job was launched.
    pub host_max_at_launch: f64,
    pub expected_completion: Instant,
}

/// Why a running job must be killed.
#[derive(Debug, Clone, PartialEq)]
pub enum TeardownReason {
    CapacityGrew { at_launch: f64, now: f64 },
    PayloadMissing,
    ParameterMismatch { target_id: TargetId, kind: OperationKind },
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapacityGrew { .. } => "capacity_grew",
            Self::PayloadMissing => "payload_missing",
            Self::ParameterMismatch { .. } => "parameter_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Teardown {
    pub host_id: HostId,
    pub handle: JobHandle,
    pub reason: TeardownReason,
}

/// What the inventory and capacity collaborators report for one host.
#[derive(Debug, Clone)]
pub struct HostObservation<'a> {
    pub host_id: &'a str,
    pub max_capacity: f64,
    pub payload_present: bool,
    pub running: &'a [JobInfo],
}

/// Jobs launched by this controller, keyed by handle.
#[derive(Debug, Clone, Default)]
pub struct JobLedger {
    jobs: BTreeMap<JobHandle, OutstandingJob>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, job: OutstandingJob) {
        debug!(handle = %job.handle, host = %job.host_id, group = %job.group, "job recorded");
        self.jobs.insert(job.handle, job);
    }

    pub fn remove(&mut self, handle: JobHandle) -> Option<OutstandingJob> {
        self.jobs.remove(&handle)
    }

    pub fn get(&self, handle: JobHandle) -> Option<&OutstandingJob> {
        self.jobs.get(&handle)
    }

    pub fn jobs_on<'a>(&'a self, host_id: &'a str) -> impl Iterator<Item = &'a OutstandingJob> + 'a {
        self.jobs.values().filter(move |j| j.host_id == host_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutstandingJob> {
        self.jobs.values()
    }

    /// Latest expected completion of the jobs still outstanding against `target_id`.
    pub fn busy_until(&self, target_id: &str) -> Option<Instant> {
        self.jobs
            .values()
            .filter(|j| j.target_id == target_id)
            .map(|j| j.expected_completion)
            .max()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Prune finished entries and decide which running jobs to kill.
    ///
    /// `planned` holds every `(target, kind)` pair the controller intends to
    /// keep running; anything else on a host is a mismatch.
    pub fn reconcile(
        &mut self,
        hosts: &[HostObservation<'_>],
        planned: &HashSet<(TargetId, OperationKind)>,
    ) -> Vec<Teardown> {
        let mut teardowns: Vec<Teardown> = Vec::new();
        let mut seen: HashSet<JobHandle> = HashSet::new();

        // Jobs on hosts that left the fleet or lost access can no longer be
        // observed or killed.
        let observed: HashSet<&str> = hosts.iter().map(|o| o.host_id).collect();
        let unreachable: Vec<JobHandle> = self
            .jobs
            .values()
            .filter(|j| !observed.contains(j.host_id.as_str()))
            .map(|j| j.handle)
            .collect();
        for handle in unreachable {
            if let Some(job) = self.jobs.remove(&handle) {
                debug!(host = %job.host_id, %handle, "host no longer observed, job dropped from ledger");
            }
        }

        for obs in hosts {
            let running: HashSet<JobHandle> = obs.running.iter().map(|j| j.handle).collect();

            let finished: Vec<JobHandle> = self
                .jobs_on(obs.host_id)
                .filter(|j| !running.contains(&j.handle))
                .map(|j| j.handle)
                .collect();
            for handle in finished {
                self.jobs.remove(&handle);
                debug!(host = obs.host_id, %handle, "job finished, pruned from ledger");
            }

            let mut push = |handle: JobHandle, reason: TeardownReason| {
                if seen.insert(handle) {
                    teardowns.push(Teardown {
                        host_id: obs.host_id.to_string(),
                        handle,
                        reason,
                    });
                }
            };

            if !obs.payload_present {
                for job in obs.running {
                    push(job.handle, TeardownReason::PayloadMissing);
                }
                continue;
            }

            for job in self.jobs_on(obs.host_id) {
                if obs.max_capacity > job.host_max_at_launch + CAPACITY_EPSILON {
                    push(
                        job.handle,
                        TeardownReason::CapacityGrew {
                            at_launch: job.host_max_at_launch,
                            now: obs.max_capacity,
                        },
                    );
                }
            }

            for job in obs.running {
                if !planned.contains(&(job.target_id.clone(), job.kind)) {
                    push(
                        job.handle,
                        TeardownReason::ParameterMismatch {
                            target_id: job.target_id.clone(),
                            kind: job.kind,
                        },
                    );
                }
            }
        }

        if !teardowns.is_empty() {
            info!(count = teardowns.len(), "stale jobs selected for teardown");
        }
        teardowns
    }
}
