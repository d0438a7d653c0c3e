//! Batch planner: thread counts for one full extraction cycle.
//!
//! A batch is four groups: extract a fraction of value, restore the
//! defense that extraction added, grow value back to the floor, and
//! restore the defense that growth added. Restore counts are derived from
//! the defense deltas, not from fixed ratios.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use batchgrid_core::model::validate_inputs;
use batchgrid_core::{
    ActorCapability, BatchConfig, BatchGroup, OperationKind, OperationModel, TargetId,
    TargetSnapshot, ThreadCost,
};

use crate::error::{PlanError, PlanResult};

/// Slack applied before rounding thread counts up, so that float noise on
/// an exact quotient does not add a thread.
const CEIL_EPSILON: f64 = 1e-9;

/// Iteration cap for the grow-thread search.
const MAX_SEARCH_ITERATIONS: u32 = 64;

/// Policy inputs for one planning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanParams {
    /// Fraction of current value to extract, in `[0, 1)`.
    pub extract_fraction: f64,
    /// Value ratio a batch must restore, in `[0, 1]`.
    pub value_floor: f64,
    /// Defense above the floor tolerated before planning a prep batch.
    pub prep_defense_slack: f64,
    /// Upper bound for the grow search, usually derived from fleet capacity.
    pub max_grow_threads: u32,
    pub thread_cost: ThreadCost,
}

impl PlanParams {
    pub fn from_config(config: &BatchConfig, max_grow_threads: u32) -> Self {
        Self {
            extract_fraction: config.extract_fraction,
            value_floor: config.value_floor,
            prep_defense_slack: config.prep_defense_slack,
            max_grow_threads,
            thread_cost: config.thread_cost.clone(),
        }
    }

    fn validate(&self) -> PlanResult<()> {
        if !(0.0..1.0).contains(&self.extract_fraction) {
            return Err(PlanError::InvalidParameter(format!(
                "extract_fraction {} not in [0, 1)",
                self.extract_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.value_floor) {
            return Err(PlanError::InvalidParameter(format!(
                "value_floor {} not in [0, 1]",
                self.value_floor
            )));
        }
        if self.max_grow_threads == 0 {
            return Err(PlanError::InvalidParameter(
                "max_grow_threads must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Duration of each operation kind at plan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDurations {
    pub extract: Duration,
    pub restore: Duration,
    pub grow: Duration,
}

impl OperationDurations {
    pub fn compute<M: OperationModel + ?Sized>(
        model: &M,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> PlanResult<Self> {
        Ok(Self {
            extract: model.duration(OperationKind::Extract, target, actor)?,
            restore: model.duration(OperationKind::Restore, target, actor)?,
            grow: model.duration(OperationKind::Grow, target, actor)?,
        })
    }

    pub fn for_kind(&self, kind: OperationKind) -> Duration {
        match kind {
            OperationKind::Extract => self.extract,
            OperationKind::Restore => self.restore,
            OperationKind::Grow => self.grow,
        }
    }

    pub fn for_group(&self, group: BatchGroup) -> Duration {
        self.for_kind(group.kind())
    }

    pub fn longest(&self) -> Duration {
        self.extract.max(self.restore).max(self.grow)
    }
}

/// Thread counts, durations, and memory cost for one batch on one target.
///
/// Recomputed every pass; never carried across passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub target_id: TargetId,
    /// True when this batch only brings the target back to its floors.
    pub prep: bool,
    pub extract_threads: u32,
    pub restore_threads1: u32,
    pub grow_threads: u32,
    pub restore_threads2: u32,
    /// Fraction of value the extract group actually removes (`threads * effect`).
    pub extracted_fraction: f64,
    /// Value expected once the extract group has landed.
    pub value_after_extract: f64,
    /// Value threshold the grow group was sized to reach.
    pub grow_goal: f64,
    /// Extracted value weighted by the success chance.
    pub expected_yield: f64,
    /// The grow search hit `max_grow_threads` before reaching the goal.
    pub grow_capped: bool,
    pub durations: OperationDurations,
    pub thread_cost: ThreadCost,
}

impl BatchPlan {
    pub fn threads(&self, group: BatchGroup) -> u32 {
        match group {
            BatchGroup::Extract => self.extract_threads,
            BatchGroup::Restore1 => self.restore_threads1,
            BatchGroup::Grow => self.grow_threads,
            BatchGroup::Restore2 => self.restore_threads2,
        }
    }

    pub fn total_threads(&self) -> u64 {
        BatchGroup::ALL
            .iter()
            .map(|g| u64::from(self.threads(*g)))
            .sum()
    }

    pub fn ram_per_thread(&self, kind: OperationKind) -> f64 {
        self.thread_cost.for_kind(kind)
    }

    pub fn ram_for_group(&self, group: BatchGroup) -> f64 {
        f64::from(self.threads(group)) * self.ram_per_thread(group.kind())
    }

    pub fn ram_for_kind(&self, kind: OperationKind) -> f64 {
        BatchGroup::ALL
            .iter()
            .filter(|g| g.kind() == kind)
            .map(|g| self.ram_for_group(*g))
            .sum()
    }

    pub fn total_ram(&self) -> f64 {
        BatchGroup::ALL.iter().map(|g| self.ram_for_group(*g)).sum()
    }

    /// Operation kinds this plan actually launches.
    pub fn active_kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<OperationKind> = BatchGroup::ALL
            .iter()
            .filter(|g| self.threads(**g) > 0)
            .map(|g| g.kind())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// Plan a prep batch when the target is off its floors, a regular batch otherwise.
pub fn plan_target<M: OperationModel + ?Sized>(
    model: &M,
    target: &TargetSnapshot,
    actor: &ActorCapability,
    params: &PlanParams,
) -> PlanResult<BatchPlan> {
    if target.is_prepped(params.prep_defense_slack, params.value_floor) {
        plan_batch(model, target, actor, params)
    } else {
        debug!(
            target = %target.target_id,
            defense = target.defense_current,
            defense_min = target.defense_min,
            value_ratio = target.value_ratio(),
            "target off its floors, planning prep batch"
        );
        plan_prep(model, target, actor, params)
    }
}

/// Size the four groups of a full extraction batch.
pub fn plan_batch<M: OperationModel + ?Sized>(
    model: &M,
    target: &TargetSnapshot,
    actor: &ActorCapability,
    params: &PlanParams,
) -> PlanResult<BatchPlan> {
    params.validate()?;
    check_target(target, actor)?;

    let value = target.value_current.min(target.value_max);
    let f = params.extract_fraction;

    let extract_effect = model.effect_per_thread(OperationKind::Extract, target, actor)?;
    if f > 0.0 && extract_effect <= 0.0 {
        return Err(PlanError::InsufficientCapability(target.target_id.clone()));
    }
    let extract_threads = if f > 0.0 {
        ceil_threads(f / extract_effect).max(1)
    } else {
        0
    };

    let extracted_fraction = (f64::from(extract_threads) * extract_effect).min(1.0);
    let value_after_extract = value * (1.0 - extracted_fraction);

    let restore_effect = restore_effect(model, target, actor)?;
    let extract_defense = model.defense_delta_per_thread(OperationKind::Extract, target, actor)?;
    let restore_threads1 = offset_threads(extract_defense, extract_threads, restore_effect);

    let grow_goal = target.value_max * params.value_floor;
    let (grow_threads, grow_capped) =
        grow_threads_for(model, target, actor, value_after_extract, grow_goal, params.max_grow_threads)?;

    let grow_defense = model.defense_delta_per_thread(OperationKind::Grow, target, actor)?;
    let restore_threads2 = offset_threads(grow_defense, grow_threads, restore_effect);

    let durations = OperationDurations::compute(model, target, actor)?;

    let plan = BatchPlan {
        target_id: target.target_id.clone(),
        prep: false,
        extract_threads,
        restore_threads1,
        grow_threads,
        restore_threads2,
        extracted_fraction,
        value_after_extract,
        grow_goal,
        expected_yield: value * extracted_fraction * target.extract_success_chance,
        grow_capped,
        durations,
        thread_cost: params.thread_cost.clone(),
    };

    debug!(
        target = %plan.target_id,
        extract = plan.extract_threads,
        restore1 = plan.restore_threads1,
        grow = plan.grow_threads,
        restore2 = plan.restore_threads2,
        ram = plan.total_ram(),
        "batch planned"
    );
    Ok(plan)
}

/// Size a batch that only restores defense to its minimum and grows value
/// back to the floor.
pub fn plan_prep<M: OperationModel + ?Sized>(
    model: &M,
    target: &TargetSnapshot,
    actor: &ActorCapability,
    params: &PlanParams,
) -> PlanResult<BatchPlan> {
    params.validate()?;
    check_target(target, actor)?;

    let value = target.value_current.min(target.value_max);
    let restore_effect = restore_effect(model, target, actor)?;
    let restore_threads1 = threads_to_cover(target.excess_defense(), restore_effect);

    let grow_goal = target.value_max * params.value_floor;
    let (grow_threads, grow_capped) =
        grow_threads_for(model, target, actor, value, grow_goal, params.max_grow_threads)?;

    let grow_defense = model.defense_delta_per_thread(OperationKind::Grow, target, actor)?;
    let restore_threads2 = offset_threads(grow_defense, grow_threads, restore_effect);

    let durations = OperationDurations::compute(model, target, actor)?;

    let plan = BatchPlan {
        target_id: target.target_id.clone(),
        prep: true,
        extract_threads: 0,
        restore_threads1,
        grow_threads,
        restore_threads2,
        extracted_fraction: 0.0,
        value_after_extract: value,
        grow_goal,
        expected_yield: 0.0,
        grow_capped,
        durations,
        thread_cost: params.thread_cost.clone(),
    };

    debug!(
        target = %plan.target_id,
        restore1 = plan.restore_threads1,
        grow = plan.grow_threads,
        restore2 = plan.restore_threads2,
        "prep batch planned"
    );
    Ok(plan)
}

fn check_target(target: &TargetSnapshot, actor: &ActorCapability) -> PlanResult<()> {
    validate_inputs(target, actor)?;
    if target.value_max <= 0.0 {
        return Err(PlanError::NotExtractable(target.target_id.clone()));
    }
    Ok(())
}

fn restore_effect<M: OperationModel + ?Sized>(
    model: &M,
    target: &TargetSnapshot,
    actor: &ActorCapability,
) -> PlanResult<f64> {
    let effect = model.effect_per_thread(OperationKind::Restore, target, actor)?;
    if !effect.is_finite() || effect <= 0.0 {
        return Err(PlanError::InvalidParameter(format!(
            "restore effect per thread must be > 0, got {effect}"
        )));
    }
    Ok(effect)
}

/// Restore threads needed to cancel `threads` threads of `delta` defense each.
fn offset_threads(delta: f64, threads: u32, restore_effect: f64) -> u32 {
    if delta <= 0.0 || threads == 0 {
        return 0;
    }
    threads_to_cover(delta * f64::from(threads), restore_effect)
}

/// Fewest threads of `per_thread` each whose total reaches `need`.
fn threads_to_cover(need: f64, per_thread: f64) -> u32 {
    let threads = ceil_threads(need / per_thread);
    if f64::from(threads) * per_thread < need {
        threads.saturating_add(1)
    } else {
        threads
    }
}

fn ceil_threads(x: f64) -> u32 {
    if !x.is_finite() || x <= 0.0 {
        return if x == f64::INFINITY { u32::MAX } else { 0 };
    }
    // `as` saturates at u32::MAX.
    (x - CEIL_EPSILON).ceil().max(0.0) as u32
}

/// Smallest Grow thread count that lifts `from_value` to `goal`.
///
/// Grow is evaluated at minimum defense because it always lands after a
/// restore group. Returns `(max_threads, true)` when even the bound falls
/// short.
fn grow_threads_for<M: OperationModel + ?Sized>(
    model: &M,
    target: &TargetSnapshot,
    actor: &ActorCapability,
    from_value: f64,
    goal: f64,
    max_threads: u32,
) -> PlanResult<(u32, bool)> {
    if from_value >= goal {
        return Ok((0, false));
    }

    let settled = TargetSnapshot {
        value_current: from_value,
        ..target.at_min_defense()
    };
    let reaches = |threads: u32| -> PlanResult<bool> {
        Ok(model.grow_value(&settled, actor, from_value, threads)? >= goal)
    };

    if !reaches(max_threads)? {
        warn!(
            target = %target.target_id,
            max_threads,
            goal,
            "grow search bound reached before value floor"
        );
        return Ok((max_threads, true));
    }

    // Invariant: reaches(hi) holds, reaches(lo - 1) does not.
    let mut lo: u32 = 1;
    let mut hi: u32 = max_threads;
    let mut iterations = 0;
    while lo < hi && iterations < MAX_SEARCH_ITERATIONS {
        let mid = lo + (hi - lo) / 2;
        if reaches(mid)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
        iterations += 1;
    }
    Ok((hi, false))
}
