//! The control loop.
//!
//! One cycle:
//! 1. refresh the host cache and pick this cycle's targets
//! 2. reconcile the job ledger and kill stale jobs, then let capacity settle
//! 3. for each target: fresh snapshot, plan, schedule, allocate, launch
//! 4. sleep until the longest batch has landed, never less than
//!    `min_pass_interval`
//!
//! Per-target planner errors abort only that target's pass. Launch
//! failures feed the backoff table. Nothing in a cycle is fatal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use batchgrid_core::{BatchConfig, HostCapacity, HostId, JobInfo, OperationKind, OperationModel, TargetId};
use batchgrid_placement::{FreeCapacity, LaunchReport, allocate, execute};
use batchgrid_planner::{
    Anchor, PlanParams, anchor_after, landing_order, plan_target, schedule_or_serialize,
};
use batchgrid_supervisor::{BackoffPolicy, BackoffTable, HostObservation, JobLedger, OutstandingJob, Teardown};

use crate::cache::HostCache;
use crate::error::{ControllerError, ControllerResult};
use crate::fleet::{Fleet, TargetPolicy};
use crate::outcome::{OutcomeLog, PassOutcome};

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub targets: Vec<TargetId>,
    pub teardowns: Vec<Teardown>,
    pub outcomes: Vec<PassOutcome>,
    pub errors: Vec<ControllerError>,
    /// How long the loop waits before the next cycle.
    pub next_pass_in: Duration,
}

pub struct Controller<F: ?Sized, M> {
    fleet: Arc<F>,
    model: M,
    config: BatchConfig,
    cache: HostCache,
    backoff: BackoffTable,
    ledger: JobLedger,
    outcomes: OutcomeLog,
    /// Operation kinds the last plan for each target launched.
    planned_kinds: HashMap<TargetId, Vec<OperationKind>>,
}

impl<F, M> Controller<F, M>
where
    F: Fleet + ?Sized,
    M: OperationModel,
{
    pub fn new(fleet: Arc<F>, model: M, config: BatchConfig) -> ControllerResult<Self> {
        config.validate()?;
        let backoff = BackoffTable::new(BackoffPolicy::from_config(&config));
        Ok(Self {
            fleet,
            model,
            config,
            cache: HostCache::new(),
            backoff,
            ledger: JobLedger::new(),
            outcomes: OutcomeLog::default(),
            planned_kinds: HashMap::new(),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn fleet(&self) -> &Arc<F> {
        &self.fleet
    }

    pub fn backoff(&self) -> &BackoffTable {
        &self.backoff
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn outcomes(&self) -> &OutcomeLog {
        &self.outcomes
    }

    pub fn cache(&self) -> &HostCache {
        &self.cache
    }

    /// Primary target first, then the throughput target if it differs,
    /// up to `max_targets`.
    pub fn choose_targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = Vec::new();
        for policy in [TargetPolicy::Value, TargetPolicy::Throughput] {
            if targets.len() >= self.config.max_targets {
                break;
            }
            if let Some(target) = self.fleet.choose_target(policy) {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    /// Every `(target, kind)` pair allowed to keep running. A target with
    /// no plan yet accepts every kind.
    fn planned_set(&self, targets: &[TargetId]) -> HashSet<(TargetId, OperationKind)> {
        let mut planned = HashSet::new();
        for target in targets {
            let kinds = self
                .planned_kinds
                .get(target)
                .map(|k| k.as_slice())
                .unwrap_or(&OperationKind::ALL);
            for kind in kinds {
                planned.insert((target.clone(), *kind));
            }
        }
        planned
    }

    /// Reconcile the ledger against the fleet and kill whatever is stale.
    pub fn reconcile(&mut self, targets: &[TargetId]) -> Vec<Teardown> {
        let planned = self.planned_set(targets);

        let observed: Vec<(HostId, f64, bool, Vec<JobInfo>)> = self
            .cache
            .hosts()
            .iter()
            .filter_map(|h| {
                let capacity = self.fleet.host_capacity(h)?;
                Some((
                    h.clone(),
                    capacity.max_capacity,
                    self.fleet.has_payload(h),
                    self.fleet.list_running_jobs(h),
                ))
            })
            .collect();
        let observations: Vec<HostObservation<'_>> = observed
            .iter()
            .map(|(host_id, max_capacity, payload_present, running)| HostObservation {
                host_id,
                max_capacity: *max_capacity,
                payload_present: *payload_present,
                running,
            })
            .collect();

        let teardowns = self.ledger.reconcile(&observations, &planned);
        for t in &teardowns {
            let killed = self.fleet.kill(t.handle);
            self.ledger.remove(t.handle);
            info!(
                host = %t.host_id,
                handle = %t.handle,
                reason = t.reason.as_str(),
                killed,
                "stale job torn down"
            );
        }
        teardowns
    }

    /// Plan, schedule, allocate and launch one batch against `target_id`.
    pub fn run_pass(&mut self, target_id: &str, now: Instant) -> ControllerResult<PassOutcome> {
        let aborted = |source| ControllerError::Plan {
            target_id: target_id.to_string(),
            source,
        };

        let snapshot = self.fleet.snapshot(target_id).map_err(aborted)?;
        let actor = self.fleet.actor_capability();

        let hosts = self.cache.capacities(self.fleet.as_ref(), &self.config.reserve);
        let blocked = self.backoff.blocked_hosts(now);

        let grow_cost = self.config.thread_cost.for_kind(OperationKind::Grow);
        let fleet_threads = FreeCapacity::new(&hosts, &blocked).thread_capacity(grow_cost);
        let max_grow_threads = u32::try_from(fleet_threads).unwrap_or(u32::MAX).max(1);
        let params = PlanParams::from_config(&self.config, max_grow_threads);

        let plan = plan_target(&self.model, &snapshot, &actor, &params).map_err(aborted)?;

        let policy = self.config.schedule_policy;
        let gap = self.config.safety_gap();
        // Queue behind a batch for this target that is still landing.
        let busy_for = self
            .ledger
            .busy_until(target_id)
            .filter(|until| *until > now)
            .map(|until| until - now);
        let anchor = match busy_for {
            Some(busy) => anchor_after(busy, gap, policy),
            None => Anchor::Earliest,
        };
        let mut schedule = schedule_or_serialize(&plan.durations, gap, policy, anchor).map_err(aborted)?;
        if let (true, Some(busy)) = (schedule.serialized, busy_for) {
            schedule = schedule.delayed(busy + gap);
        }

        let allocation = allocate(&plan, &landing_order(policy), &hosts, &blocked);
        let report = execute(&allocation, &schedule, self.fleet.as_ref());
        self.record_launches(&report, &hosts, now);

        self.planned_kinds
            .insert(target_id.to_string(), plan.active_kinds());

        let outcome = PassOutcome::new(&plan, &schedule, &allocation, &report);
        if outcome.degraded {
            warn!(
                target = %outcome.target_id,
                planned = outcome.planned_threads,
                assigned = outcome.assigned_threads,
                failed_hosts = ?outcome.failed_hosts,
                "degraded pass"
            );
        } else {
            info!(
                target = %outcome.target_id,
                prep = outcome.prep,
                threads = outcome.assigned_threads,
                cycle_ms = outcome.cycle_length.as_millis() as u64,
                "pass complete"
            );
        }
        self.outcomes.push(outcome.clone());
        Ok(outcome)
    }

    fn record_launches(&mut self, report: &LaunchReport, hosts: &[HostCapacity], now: Instant) {
        for host in report.failed_hosts() {
            self.backoff.record_failure(&host, now);
        }
        for host in report.succeeded_hosts() {
            self.backoff.record_success(&host);
        }

        for job in &report.launched {
            let host_max_at_launch = hosts
                .iter()
                .find(|h| h.host_id == job.request.host_id)
                .map(|h| h.max_capacity)
                .unwrap_or(0.0);
            self.ledger.record(OutstandingJob {
                handle: job.handle,
                host_id: job.request.host_id.clone(),
                group: job.request.group,
                kind: job.request.kind,
                target_id: job.request.target_id.clone(),
                threads: job.request.threads,
                host_max_at_launch,
                expected_completion: now + job.lands_after(),
            });
        }
    }

    /// Run one cycle at the current wall-clock time.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Instant::now()).await
    }

    /// Run one cycle treating `now` as the current time.
    pub async fn run_cycle_at(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();

        self.cache.refresh(self.fleet.as_ref());
        report.targets = self.choose_targets();
        if report.targets.is_empty() {
            debug!("no target chosen this cycle");
        }

        report.teardowns = self.reconcile(&report.targets);
        let mut now = now;
        if !report.teardowns.is_empty() {
            let settle = self.config.settle_delay();
            tokio::time::sleep(settle).await;
            now += settle;
        }

        for target in report.targets.clone() {
            match self.run_pass(&target, now) {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    warn!(target = %target, error = %e, "target skipped this pass");
                    report.errors.push(e);
                }
            }
        }

        let gap = self.config.safety_gap();
        report.next_pass_in = report
            .outcomes
            .iter()
            .map(|o| o.cycle_length + gap)
            .max()
            .unwrap_or_default()
            .max(self.config.min_pass_interval());
        report
    }

    /// Run cycles until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            policy = ?self.config.schedule_policy,
            max_targets = self.config.max_targets,
            "batch controller started"
        );

        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let report = self.run_cycle().await;
                    debug!(
                        passes = report.outcomes.len(),
                        errors = report.errors.len(),
                        next_ms = report.next_pass_in.as_millis() as u64,
                        "cycle finished"
                    );
                    wait = report.next_pass_in;
                }
                _ = shutdown.changed() => {
                    info!("batch controller shutting down");
                    break;
                }
            }
        }
    }
}
