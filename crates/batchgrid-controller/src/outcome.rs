//! Pass outcome records and a bounded history of them.
//!
//! A [`PassOutcome`] is the one externally observable artifact of a pass:
//! what was planned for a target, what actually launched, and which hosts
//! failed. It serializes to a single JSON line for telemetry.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use batchgrid_core::{BatchGroup, HostId, TargetId};
use batchgrid_placement::{Allocation, LaunchReport};
use batchgrid_planner::{BatchPlan, CycleSchedule};

/// Planned vs launched threads for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub group: BatchGroup,
    pub planned: u32,
    pub assigned: u32,
    pub launched: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub target_id: TargetId,
    pub prep: bool,
    pub planned_threads: u64,
    /// Threads that actually launched. Failed launches are not counted.
    pub assigned_threads: u64,
    pub degraded: bool,
    pub failed_hosts: Vec<HostId>,
    pub serialized: bool,
    pub cycle_length: Duration,
    pub expected_yield: f64,
    pub groups: Vec<GroupOutcome>,
}

impl PassOutcome {
    pub fn new(
        plan: &BatchPlan,
        schedule: &CycleSchedule,
        allocation: &Allocation,
        report: &LaunchReport,
    ) -> Self {
        let groups: Vec<GroupOutcome> = allocation
            .groups
            .iter()
            .map(|g| GroupOutcome {
                group: g.group,
                planned: plan.threads(g.group),
                assigned: g.assigned,
                launched: report.launched_threads(g.group),
            })
            .collect();
        let planned_threads = plan.total_threads();
        let assigned_threads = report.total_launched_threads();

        Self {
            target_id: plan.target_id.clone(),
            prep: plan.prep,
            planned_threads,
            assigned_threads,
            degraded: allocation.degraded() || assigned_threads < planned_threads,
            failed_hosts: report.failed_hosts(),
            serialized: schedule.serialized,
            cycle_length: schedule.cycle_length(),
            expected_yield: plan.expected_yield,
            groups,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Most recent pass outcomes, oldest evicted first.
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    capacity: usize,
    entries: VecDeque<PassOutcome>,
    total: u64,
    degraded: u64,
}

impl Default for OutcomeLog {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl OutcomeLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            total: 0,
            degraded: 0,
        }
    }

    pub fn push(&mut self, outcome: PassOutcome) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.total += 1;
        if outcome.degraded {
            self.degraded += 1;
        }
        self.entries.push_back(outcome);
    }

    pub fn latest(&self) -> Option<&PassOutcome> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PassOutcome> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Passes recorded since start, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn degraded_total(&self) -> u64 {
        self.degraded
    }
}
