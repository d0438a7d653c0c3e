//! In-memory fleet implementing every collaborator trait.
//!
//! The simulation runs on its own clock, which only moves when
//! [`SimFleet::advance`] is called. A launched job holds its RAM until its
//! landing time passes; it then applies its effect to the target through
//! the configured [`OperationModel`] and releases the RAM. Extraction
//! always succeeds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use batchgrid_core::{
    ActorCapability, FormulaModel, HostCapacity, HostId, JobHandle, JobInfo, ModelResult, OperationKind,
    OperationModel, TargetId, TargetSnapshot, ThreadCost,
};
use batchgrid_placement::{JobLauncher, LaunchError, LaunchRequest};
use batchgrid_planner::{PlanError, PlanResult};

use crate::fleet::{CapacitySource, HostDirectory, JobInventory, TargetPolicy, TargetSource};

const RAM_EPSILON: f64 = 1e-9;

/// One simulated host.
#[derive(Debug, Clone, PartialEq)]
pub struct SimHost {
    pub max_capacity: f64,
    pub used_capacity: f64,
    pub payload: bool,
    pub access: bool,
}

#[derive(Debug, Clone)]
struct SimJob {
    info: JobInfo,
    ram: f64,
    lands_at: Instant,
}

struct SimState {
    origin: Instant,
    elapsed: Duration,
    actor: ActorCapability,
    thread_cost: ThreadCost,
    hosts: BTreeMap<HostId, SimHost>,
    targets: BTreeMap<TargetId, TargetSnapshot>,
    choices: HashMap<TargetPolicy, TargetId>,
    jobs: BTreeMap<JobHandle, SimJob>,
    failing: HashSet<HostId>,
    next_handle: u64,
    extracted: f64,
    landed: u64,
}

impl SimState {
    fn now(&self) -> Instant {
        self.origin + self.elapsed
    }
}

pub struct SimFleet {
    model: Box<dyn OperationModel + Send + Sync>,
    state: Mutex<SimState>,
}

impl SimFleet {
    pub fn new(actor: ActorCapability) -> Self {
        Self {
            model: Box::new(FormulaModel::default()),
            state: Mutex::new(SimState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                actor,
                thread_cost: ThreadCost::default(),
                hosts: BTreeMap::new(),
                targets: BTreeMap::new(),
                choices: HashMap::new(),
                jobs: BTreeMap::new(),
                failing: HashSet::new(),
                next_handle: 1,
                extracted: 0.0,
                landed: 0,
            }),
        }
    }

    /// Model used to apply landed effects.
    pub fn with_model<M: OperationModel + Send + Sync + 'static>(mut self, model: M) -> Self {
        self.model = Box::new(model);
        self
    }

    pub fn with_thread_cost(self, cost: ThreadCost) -> Self {
        self.lock().thread_cost = cost;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock and land every job whose time has come.
    fn settled(&self) -> MutexGuard<'_, SimState> {
        let mut guard = self.lock();
        self.land_due(&mut guard);
        guard
    }

    fn land_due(&self, state: &mut SimState) {
        let now = state.now();
        let mut due: Vec<(Instant, JobHandle)> = state
            .jobs
            .iter()
            .filter(|(_, j)| j.lands_at <= now)
            .map(|(h, j)| (j.lands_at, *h))
            .collect();
        due.sort();

        for (_, handle) in due {
            let Some(job) = state.jobs.remove(&handle) else {
                continue;
            };
            if let Some(host) = state.hosts.get_mut(&job.info.host_id) {
                host.used_capacity = (host.used_capacity - job.ram).max(0.0);
            }
            let Some(target) = state.targets.get_mut(&job.info.target_id) else {
                continue;
            };
            match apply_effect(self.model.as_ref(), &state.actor, target, job.info.kind, job.info.threads) {
                Ok(taken) => {
                    state.extracted += taken;
                    state.landed += 1;
                    debug!(
                        handle = %handle,
                        kind = %job.info.kind,
                        target = %job.info.target_id,
                        value = target.value_current,
                        defense = target.defense_current,
                        "simulated job landed"
                    );
                }
                Err(e) => warn!(handle = %handle, error = %e, "simulated job had no effect"),
            }
        }
    }

    pub fn add_host(&self, host_id: &str, max_capacity: f64) {
        self.lock().hosts.insert(
            host_id.to_string(),
            SimHost {
                max_capacity,
                used_capacity: 0.0,
                payload: true,
                access: true,
            },
        );
    }

    pub fn add_target(&self, snapshot: TargetSnapshot) {
        self.lock().targets.insert(snapshot.target_id.clone(), snapshot);
    }

    pub fn remove_target(&self, target_id: &str) {
        self.lock().targets.remove(target_id);
    }

    pub fn set_choice(&self, policy: TargetPolicy, target_id: &str) {
        self.lock().choices.insert(policy, target_id.to_string());
    }

    pub fn set_max_capacity(&self, host_id: &str, max_capacity: f64) {
        if let Some(host) = self.lock().hosts.get_mut(host_id) {
            host.max_capacity = max_capacity;
        }
    }

    /// Capacity held by processes outside the simulation.
    pub fn set_used_capacity(&self, host_id: &str, used_capacity: f64) {
        if let Some(host) = self.lock().hosts.get_mut(host_id) {
            host.used_capacity = used_capacity;
        }
    }

    pub fn set_payload(&self, host_id: &str, present: bool) {
        if let Some(host) = self.lock().hosts.get_mut(host_id) {
            host.payload = present;
        }
    }

    pub fn set_access(&self, host_id: &str, access: bool) {
        if let Some(host) = self.lock().hosts.get_mut(host_id) {
            host.access = access;
        }
    }

    /// Reject every launch on `host_id` until cleared.
    pub fn fail_launches_on(&self, host_id: &str) {
        self.lock().failing.insert(host_id.to_string());
    }

    pub fn clear_launch_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn now(&self) -> Instant {
        self.lock().now()
    }

    /// Move the simulation clock forward and land whatever came due.
    pub fn advance(&self, by: Duration) {
        let mut guard = self.lock();
        guard.elapsed += by;
        self.land_due(&mut guard);
    }

    pub fn target(&self, target_id: &str) -> Option<TargetSnapshot> {
        self.settled().targets.get(target_id).cloned()
    }

    pub fn host(&self, host_id: &str) -> Option<SimHost> {
        self.settled().hosts.get(host_id).cloned()
    }

    pub fn running_jobs(&self) -> Vec<JobInfo> {
        self.settled().jobs.values().map(|j| j.info.clone()).collect()
    }

    /// Total value removed from all targets so far.
    pub fn extracted_total(&self) -> f64 {
        self.settled().extracted
    }

    pub fn landed_jobs(&self) -> u64 {
        self.settled().landed
    }
}

/// Apply one landed job to `target`. Returns the value extracted.
fn apply_effect(
    model: &dyn OperationModel,
    actor: &ActorCapability,
    target: &mut TargetSnapshot,
    kind: OperationKind,
    threads: u32,
) -> ModelResult<f64> {
    let n = f64::from(threads);
    let delta = model.defense_delta_per_thread(kind, target, actor)?;
    match kind {
        OperationKind::Extract => {
            let fraction = (n * model.effect_per_thread(kind, target, actor)?).min(1.0);
            let taken = target.value_current * fraction;
            target.value_current -= taken;
            target.defense_current += n * delta;
            Ok(taken)
        }
        OperationKind::Grow => {
            target.value_current = model.grow_value(target, actor, target.value_current, threads)?;
            target.defense_current += n * delta;
            Ok(0.0)
        }
        OperationKind::Restore => {
            target.defense_current = (target.defense_current + n * delta).max(target.defense_min);
            Ok(0.0)
        }
    }
}

impl HostDirectory for SimFleet {
    fn list_hosts(&self) -> Vec<HostId> {
        self.lock().hosts.keys().cloned().collect()
    }

    fn has_access(&self, host_id: &str) -> bool {
        self.lock().hosts.get(host_id).is_some_and(|h| h.access)
    }
}

impl TargetSource for SimFleet {
    fn snapshot(&self, target_id: &str) -> PlanResult<TargetSnapshot> {
        self.settled()
            .targets
            .get(target_id)
            .cloned()
            .ok_or_else(|| PlanError::UnknownTarget(target_id.to_string()))
    }

    fn choose_target(&self, policy: TargetPolicy) -> Option<TargetId> {
        self.lock().choices.get(&policy).cloned()
    }

    fn actor_capability(&self) -> ActorCapability {
        self.lock().actor.clone()
    }
}

impl CapacitySource for SimFleet {
    fn host_capacity(&self, host_id: &str) -> Option<HostCapacity> {
        self.settled()
            .hosts
            .get(host_id)
            .map(|h| HostCapacity::new(host_id, h.max_capacity, h.used_capacity))
    }
}

impl JobInventory for SimFleet {
    fn list_running_jobs(&self, host_id: &str) -> Vec<JobInfo> {
        self.settled()
            .jobs
            .values()
            .filter(|j| j.info.host_id == host_id)
            .map(|j| j.info.clone())
            .collect()
    }

    fn kill(&self, handle: JobHandle) -> bool {
        let mut state = self.lock();
        let Some(job) = state.jobs.remove(&handle) else {
            return false;
        };
        if let Some(host) = state.hosts.get_mut(&job.info.host_id) {
            host.used_capacity = (host.used_capacity - job.ram).max(0.0);
        }
        true
    }

    fn has_payload(&self, host_id: &str) -> bool {
        self.lock().hosts.get(host_id).is_some_and(|h| h.payload)
    }
}

impl JobLauncher for SimFleet {
    fn launch(&self, request: &LaunchRequest) -> Result<JobHandle, LaunchError> {
        let mut guard = self.settled();
        let state = &mut *guard;
        let now = state.now();

        let host_id = &request.host_id;
        let Some(host) = state.hosts.get_mut(host_id) else {
            return Err(LaunchError::HostUnreachable(host_id.clone()));
        };
        if !host.access {
            return Err(LaunchError::HostUnreachable(host_id.clone()));
        }
        if state.failing.contains(host_id) {
            return Err(LaunchError::Rejected(format!("injected failure on {host_id}")));
        }
        if !host.payload {
            return Err(LaunchError::PayloadMissing(host_id.clone()));
        }

        let ram = f64::from(request.threads) * state.thread_cost.for_kind(request.kind);
        let free = host.max_capacity - host.used_capacity;
        if ram > free + RAM_EPSILON {
            return Err(LaunchError::InsufficientCapacity {
                host: host_id.clone(),
                needed: ram,
                free,
            });
        }
        host.used_capacity += ram;

        let handle = JobHandle(state.next_handle);
        state.next_handle += 1;
        state.jobs.insert(
            handle,
            SimJob {
                info: JobInfo {
                    handle,
                    host_id: host_id.clone(),
                    kind: request.kind,
                    target_id: request.target_id.clone(),
                    threads: request.threads,
                },
                ram,
                lands_at: now + request.start_delay + request.duration,
            },
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use batchgrid_core::{BatchGroup, ConstantModel};

    use super::*;

    fn fleet() -> SimFleet {
        let fleet = SimFleet::new(ActorCapability::default()).with_model(ConstantModel::default());
        fleet.add_host("home", 32.0);
        fleet.add_target(TargetSnapshot {
            target_id: "n00dles".to_string(),
            value_current: 100_000.0,
            value_max: 100_000.0,
            defense_current: 1.0,
            defense_min: 1.0,
            growth_factor: 3000.0,
            extract_success_chance: 1.0,
            required_skill: 1.0,
        });
        fleet
    }

    fn request(kind: OperationKind, threads: u32, delay_secs: u64) -> LaunchRequest {
        let group = match kind {
            OperationKind::Extract => BatchGroup::Extract,
            OperationKind::Restore => BatchGroup::Restore1,
            OperationKind::Grow => BatchGroup::Grow,
        };
        LaunchRequest {
            host_id: "home".to_string(),
            group,
            kind,
            threads,
            target_id: "n00dles".to_string(),
            start_delay: Duration::from_secs(delay_secs),
            duration: Duration::from_secs(10),
        }
    }

    #[test]
    fn launch_reserves_ram_until_landing() {
        let fleet = fleet();
        fleet.launch(&request(OperationKind::Extract, 10, 0)).unwrap();

        let home = fleet.host("home").unwrap();
        assert!((home.used_capacity - 17.0).abs() < 1e-9);
        assert_eq!(fleet.running_jobs().len(), 1);

        fleet.advance(Duration::from_secs(10));

        assert_eq!(fleet.running_jobs().len(), 0);
        assert_eq!(fleet.host("home").unwrap().used_capacity, 0.0);
        let target = fleet.target("n00dles").unwrap();
        assert!((target.value_current - 90_000.0).abs() < 1e-6);
        assert!((target.defense_current - 1.02).abs() < 1e-9);
        assert!((fleet.extracted_total() - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn restore_never_drops_below_minimum() {
        let fleet = fleet();
        // 17 + 14 RAM fits the 32 RAM host.
        fleet.launch(&request(OperationKind::Extract, 10, 0)).unwrap();
        fleet.launch(&request(OperationKind::Restore, 8, 1)).unwrap();

        fleet.advance(Duration::from_secs(10));
        assert!((fleet.target("n00dles").unwrap().defense_current - 1.02).abs() < 1e-9);

        // 8 threads take off 0.4, far more than the 0.02 above the floor.
        fleet.advance(Duration::from_secs(2));
        assert_eq!(fleet.target("n00dles").unwrap().defense_current, 1.0);
        assert_eq!(fleet.landed_jobs(), 2);
    }

    #[test]
    fn launch_fails_when_host_is_full() {
        let fleet = fleet();
        let err = fleet.launch(&request(OperationKind::Grow, 100, 0)).unwrap_err();
        assert!(matches!(err, LaunchError::InsufficientCapacity { .. }));
    }

    #[test]
    fn injected_failures_and_missing_payload() {
        let fleet = fleet();
        fleet.fail_launches_on("home");
        assert!(matches!(
            fleet.launch(&request(OperationKind::Grow, 1, 0)),
            Err(LaunchError::Rejected(_))
        ));

        fleet.clear_launch_failures();
        fleet.set_payload("home", false);
        assert!(matches!(
            fleet.launch(&request(OperationKind::Grow, 1, 0)),
            Err(LaunchError::PayloadMissing(_))
        ));
    }

    #[test]
    fn kill_releases_ram() {
        let fleet = fleet();
        let handle = fleet.launch(&request(OperationKind::Grow, 4, 30)).unwrap();
        assert!(fleet.kill(handle));
        assert!(!fleet.kill(handle));
        assert_eq!(fleet.host("home").unwrap().used_capacity, 0.0);
    }

    #[test]
    fn unknown_target_snapshot_fails() {
        let fleet = fleet();
        fleet.remove_target("n00dles");
        assert_eq!(
            fleet.snapshot("n00dles"),
            Err(PlanError::UnknownTarget("n00dles".to_string()))
        );
    }

    #[test]
    fn access_filters_directory() {
        let fleet = fleet();
        fleet.add_host("csec", 8.0);
        fleet.set_access("csec", false);
        assert_eq!(fleet.list_hosts(), vec!["csec".to_string(), "home".to_string()]);
        assert!(!fleet.has_access("csec"));
        assert!(fleet.has_access("home"));
    }
}
