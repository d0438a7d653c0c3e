//! Cycle scheduler: start delays that make the four groups land in order.
//!
//! Every group is launched at the same instant with its own start delay.
//! Completion times are laid out relative to the first restore group:
//!
//! ```text
//! extract_first:  Extract  = t0 - G   Restore1 = t0   Grow = t0 + G    Restore2 = t0 + 2G
//! restore_first:  Restore1 = t0       Extract  = t0+G Grow = t0 + 2G   Restore2 = t0 + 3G
//!
//! start_delay(group) = completion(group) - duration(group)
//! ```
//!
//! A negative start delay means the anchor is too early for the current
//! durations; the caller falls back to [`serialize_cycle`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use batchgrid_core::{BatchGroup, SchedulePolicy};

use crate::error::{PlanError, PlanResult};
use crate::planner::OperationDurations;

/// Where the first restore group's completion is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// As early as possible: the group with the least slack starts immediately.
    Earliest,
    /// At a fixed offset from launch.
    At(Duration),
}

/// Timing for one group, all offsets measured from launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTiming {
    pub group: BatchGroup,
    pub start_delay: Duration,
    pub duration: Duration,
    pub completion: Duration,
}

/// Start delays for all four groups, in landing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSchedule {
    pub policy: SchedulePolicy,
    pub gap: Duration,
    /// True when groups run back to back instead of overlapping.
    pub serialized: bool,
    pub timings: Vec<GroupTiming>,
}

impl CycleSchedule {
    pub fn timing(&self, group: BatchGroup) -> Option<&GroupTiming> {
        self.timings.iter().find(|t| t.group == group)
    }

    pub fn start_delay(&self, group: BatchGroup) -> Duration {
        self.timing(group).map(|t| t.start_delay).unwrap_or_default()
    }

    pub fn completion(&self, group: BatchGroup) -> Duration {
        self.timing(group).map(|t| t.completion).unwrap_or_default()
    }

    /// Time from launch until the last group lands.
    pub fn cycle_length(&self) -> Duration {
        self.timings
            .iter()
            .map(|t| t.completion)
            .max()
            .unwrap_or_default()
    }

    /// The same schedule pushed back by `by`.
    pub fn delayed(mut self, by: Duration) -> Self {
        for t in &mut self.timings {
            t.start_delay += by;
            t.completion += by;
        }
        self
    }

    /// Every consecutive pair of landings is at least `gap` apart.
    pub fn lands_in_order(&self) -> bool {
        self.timings
            .windows(2)
            .all(|w| w[1].completion >= w[0].completion + self.gap)
    }
}

/// Order in which groups must land for `policy`.
pub fn landing_order(policy: SchedulePolicy) -> [BatchGroup; 4] {
    match policy {
        SchedulePolicy::ExtractFirst => [
            BatchGroup::Extract,
            BatchGroup::Restore1,
            BatchGroup::Grow,
            BatchGroup::Restore2,
        ],
        SchedulePolicy::RestoreFirst => [
            BatchGroup::Restore1,
            BatchGroup::Extract,
            BatchGroup::Grow,
            BatchGroup::Restore2,
        ],
    }
}

/// Anchor that lands the first group one gap after `busy_for` has elapsed,
/// so a new batch queues behind one still in flight.
pub fn anchor_after(busy_for: Duration, gap: Duration, policy: SchedulePolicy) -> Anchor {
    let pivot = landing_order(policy)
        .iter()
        .position(|g| *g == BatchGroup::Restore1)
        .unwrap_or(0) as u32;
    Anchor::At(busy_for + gap + gap * pivot)
}

fn nanos(d: Duration) -> i128 {
    d.as_nanos() as i128
}

fn from_nanos(n: i128) -> Duration {
    let n = n.clamp(0, i128::from(u64::MAX));
    Duration::from_nanos(n as u64)
}

fn check_durations(durations: &OperationDurations) -> PlanResult<()> {
    for group in BatchGroup::ALL {
        if durations.for_group(group).is_zero() {
            return Err(PlanError::InvalidParameter(format!("{group} duration is zero")));
        }
    }
    Ok(())
}

/// Compute overlapped start delays for one batch.
pub fn schedule_cycle(
    durations: &OperationDurations,
    gap: Duration,
    policy: SchedulePolicy,
    anchor: Anchor,
) -> PlanResult<CycleSchedule> {
    check_durations(durations)?;

    let order = landing_order(policy);
    let pivot = order
        .iter()
        .position(|g| *g == BatchGroup::Restore1)
        .unwrap_or(0) as i128;
    let gap_ns = nanos(gap);

    // Completion offset of each group relative to Restore1's completion.
    let offsets: Vec<(BatchGroup, i128)> = order
        .iter()
        .enumerate()
        .map(|(i, g)| (*g, (i as i128 - pivot) * gap_ns))
        .collect();

    let t0 = match anchor {
        Anchor::At(t) => nanos(t),
        Anchor::Earliest => offsets
            .iter()
            .map(|(g, off)| nanos(durations.for_group(*g)) - off)
            .max()
            .unwrap_or(0),
    };

    let mut timings = Vec::with_capacity(order.len());
    for (group, offset) in offsets {
        let duration = durations.for_group(group);
        let completion = t0 + offset;
        let start = completion - nanos(duration);
        if start < 0 {
            let shortfall_ms = u64::try_from(-start / 1_000_000).unwrap_or(u64::MAX);
            return Err(PlanError::ScheduleInfeasible { group, shortfall_ms });
        }
        timings.push(GroupTiming {
            group,
            start_delay: from_nanos(start),
            duration,
            completion: from_nanos(completion),
        });
    }

    let schedule = CycleSchedule {
        policy,
        gap,
        serialized: false,
        timings,
    };
    debug!(
        ?policy,
        cycle_ms = schedule.cycle_length().as_millis() as u64,
        "cycle scheduled"
    );
    Ok(schedule)
}

/// Run the groups one after another, each starting a gap after the
/// previous one lands.
pub fn serialize_cycle(durations: &OperationDurations, gap: Duration, policy: SchedulePolicy) -> CycleSchedule {
    let mut timings = Vec::with_capacity(4);
    let mut cursor = Duration::ZERO;
    for (i, group) in landing_order(policy).into_iter().enumerate() {
        let start_delay = if i == 0 { cursor } else { cursor + gap };
        let duration = durations.for_group(group);
        let completion = start_delay + duration;
        timings.push(GroupTiming {
            group,
            start_delay,
            duration,
            completion,
        });
        cursor = completion;
    }
    CycleSchedule {
        policy,
        gap,
        serialized: true,
        timings,
    }
}

/// Overlapped schedule when feasible, serialized fallback otherwise.
///
/// Only an infeasible anchor triggers the fallback; invalid durations are
/// still an error.
pub fn schedule_or_serialize(
    durations: &OperationDurations,
    gap: Duration,
    policy: SchedulePolicy,
    anchor: Anchor,
) -> PlanResult<CycleSchedule> {
    match schedule_cycle(durations, gap, policy, anchor) {
        Ok(schedule) => Ok(schedule),
        Err(PlanError::ScheduleInfeasible { group, shortfall_ms }) => {
            warn!(
                %group,
                shortfall_ms,
                "overlapped schedule infeasible, serializing groups"
            );
            Ok(serialize_cycle(durations, gap, policy))
        }
        Err(e) => Err(e),
    }
}
