//! End-to-end cycles against the simulated fleet.

use std::sync::Arc;
use std::time::Duration;

use batchgrid_controller::{Controller, SimFleet, TargetPolicy};
use batchgrid_core::{ActorCapability, BatchConfig, BatchGroup, ConstantModel, TargetSnapshot, ThreadCost};
use batchgrid_planner::PlanError;
use batchgrid_supervisor::{HostHealth, TeardownReason};

fn unit_cost() -> ThreadCost {
    ThreadCost {
        extract: 1.0,
        restore: 1.0,
        grow: 1.0,
    }
}

fn config(extract_fraction: f64, value_floor: f64) -> BatchConfig {
    BatchConfig {
        extract_fraction,
        value_floor,
        settle_delay: "0ms".to_string(),
        thread_cost: unit_cost(),
        ..BatchConfig::default()
    }
}

fn target(id: &str, value: f64, defense: f64) -> TargetSnapshot {
    TargetSnapshot {
        target_id: id.to_string(),
        value_current: value,
        value_max: 1_000_000.0,
        defense_current: defense,
        defense_min: 5.0,
        growth_factor: 20.0,
        extract_success_chance: 1.0,
        required_skill: 1.0,
    }
}

fn fleet(hosts: &[(&str, f64)]) -> Arc<SimFleet> {
    let sim = SimFleet::new(ActorCapability::default())
        .with_model(ConstantModel::default())
        .with_thread_cost(unit_cost());
    for (id, max) in hosts {
        sim.add_host(id, *max);
    }
    sim.add_target(target("joesguns", 1_000_000.0, 5.0));
    sim.set_choice(TargetPolicy::Value, "joesguns");
    Arc::new(sim)
}

fn controller(sim: &Arc<SimFleet>, config: BatchConfig) -> Controller<SimFleet, ConstantModel> {
    Controller::new(Arc::clone(sim), ConstantModel::default(), config).unwrap()
}

#[tokio::test]
async fn full_pass_lands_batch_and_keeps_target_at_floor() {
    let sim = fleet(&[("home", 64.0)]);
    let mut c = controller(&sim, config(0.05, 0.9));

    let report = c.run_cycle_at(sim.now()).await;

    assert!(report.errors.is_empty());
    assert_eq!(report.outcomes.len(), 1);
    let outcome = &report.outcomes[0];
    assert!(!outcome.prep);
    assert!(!outcome.degraded);
    assert_eq!(outcome.planned_threads, 6);
    assert_eq!(outcome.assigned_threads, 6);
    assert!(outcome.failed_hosts.is_empty());
    assert_eq!(sim.running_jobs().len(), 2);
    assert_eq!(c.ledger().len(), 2);
    assert!(report.next_pass_in >= Duration::from_secs(40));

    sim.advance(report.next_pass_in);

    let after = sim.target("joesguns").unwrap();
    assert!((after.value_current - 950_000.0).abs() < 1e-6);
    assert_eq!(after.defense_current, 5.0);
    assert!(sim.running_jobs().is_empty());
    assert_eq!(sim.landed_jobs(), 2);

    // The next cycle prunes the finished jobs before launching new ones.
    let report = c.run_cycle_at(sim.now()).await;
    assert!(report.teardowns.is_empty());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(c.ledger().len(), 2);
    assert_eq!(c.outcomes().total(), 2);
}

#[tokio::test]
async fn late_second_batch_serializes_behind_landing_batch() {
    let sim = fleet(&[("home", 64.0)]);
    let mut c = controller(&sim, config(0.05, 0.9));
    c.run_cycle_at(sim.now()).await;
    let first: Vec<u64> = c.ledger().iter().map(|j| j.handle.0).collect();

    // Ten seconds of landing left is shorter than a restore.
    sim.advance(Duration::from_secs(30));
    let busy = c.ledger().busy_until("joesguns").unwrap();
    let report = c.run_cycle_at(sim.now()).await;

    assert!(report.teardowns.is_empty());
    let outcome = &report.outcomes[0];
    assert!(outcome.serialized);
    assert!(!outcome.degraded);
    let gap = c.config().safety_gap();
    let second: Vec<_> = c.ledger().iter().filter(|j| !first.contains(&j.handle.0)).collect();
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|j| j.expected_completion >= busy + gap));
}

#[tokio::test]
async fn small_fleet_gives_degraded_pass() {
    let sim = fleet(&[("home", 5.0)]);
    let mut c = controller(&sim, config(0.12, 0.5));

    let report = c.run_cycle_at(sim.now()).await;

    let outcome = &report.outcomes[0];
    assert!(outcome.degraded);
    assert_eq!(outcome.planned_threads, 13);
    assert_eq!(outcome.assigned_threads, 5);
    let extract = outcome.groups.iter().find(|g| g.group == BatchGroup::Extract).unwrap();
    assert_eq!((extract.planned, extract.assigned, extract.launched), (12, 5, 5));
    assert!(outcome.failed_hosts.is_empty());
    assert_eq!(c.outcomes().degraded_total(), 1);
}

#[tokio::test]
async fn launch_failure_backs_off_host_and_next_pass_avoids_it() {
    let sim = fleet(&[("a", 64.0), ("b", 64.0)]);
    sim.fail_launches_on("a");
    let mut c = controller(&sim, config(0.05, 0.9));
    let now = sim.now();

    let first = c.run_cycle_at(now).await;

    let outcome = &first.outcomes[0];
    assert_eq!(outcome.failed_hosts, vec!["a".to_string()]);
    assert!(outcome.degraded);
    assert!(matches!(c.backoff().health("a"), HostHealth::Backoff { fail_streak: 1, .. }));
    assert_eq!(c.backoff().health("b"), HostHealth::Healthy);

    let second = c.run_cycle_at(now).await;

    let outcome = &second.outcomes[0];
    assert!(outcome.failed_hosts.is_empty());
    assert!(!outcome.degraded);
    assert!(sim.running_jobs().iter().all(|j| j.host_id == "b"));
    // Still backing off: only a successful launch on `a` clears it.
    assert!(!c.backoff().is_eligible("a", now));
    assert!(c.backoff().is_eligible("a", now + Duration::from_secs(10)));
}

#[tokio::test]
async fn capacity_growth_tears_down_and_relaunches() {
    let sim = fleet(&[("home", 16.0)]);
    let mut c = controller(&sim, config(0.05, 0.9));
    let now = sim.now();
    c.run_cycle_at(now).await;
    let old: Vec<u64> = sim.running_jobs().iter().map(|j| j.handle.0).collect();
    assert_eq!(old.len(), 2);

    sim.set_max_capacity("home", 64.0);
    let report = c.run_cycle_at(now).await;

    assert_eq!(report.teardowns.len(), 2);
    assert!(report
        .teardowns
        .iter()
        .all(|t| matches!(t.reason, TeardownReason::CapacityGrew { at_launch, now } if at_launch == 16.0 && now == 64.0)));
    let running = sim.running_jobs();
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|j| !old.contains(&j.handle.0)));
    assert!(c.ledger().iter().all(|j| j.host_max_at_launch == 64.0));
}

#[tokio::test]
async fn missing_payload_tears_down_and_fails_launch() {
    let sim = fleet(&[("home", 64.0)]);
    let mut c = controller(&sim, config(0.05, 0.9));
    let now = sim.now();
    c.run_cycle_at(now).await;

    sim.set_payload("home", false);
    let report = c.run_cycle_at(now).await;

    assert_eq!(report.teardowns.len(), 2);
    assert!(report.teardowns.iter().all(|t| t.reason == TeardownReason::PayloadMissing));
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.assigned_threads, 0);
    assert_eq!(outcome.failed_hosts, vec!["home".to_string()]);
    assert!(sim.running_jobs().is_empty());
    assert!(!c.backoff().is_eligible("home", now));
}

#[tokio::test]
async fn lost_hosts_leave_the_ledger() {
    let sim = fleet(&[("a", 4.0), ("b", 4.0)]);
    let mut c = controller(&sim, config(0.05, 0.9));
    c.run_cycle_at(sim.now()).await;
    let hosts: Vec<&str> = c.ledger().iter().map(|j| j.host_id.as_str()).collect();
    assert!(hosts.contains(&"a") && hosts.contains(&"b"));

    sim.set_access("a", false);
    sim.set_access("b", false);
    for _ in 0..3 {
        sim.advance(Duration::from_secs(3600));
        c.run_cycle_at(sim.now()).await;
    }

    assert!(c.ledger().is_empty());
    assert!(c.cache().hosts().is_empty());
}

#[tokio::test]
async fn switching_target_tears_down_old_jobs() {
    let sim = fleet(&[("home", 64.0)]);
    sim.add_target(target("phantasy", 1_000_000.0, 5.0));
    let mut c = controller(&sim, config(0.05, 0.9));
    let now = sim.now();
    c.run_cycle_at(now).await;

    sim.set_choice(TargetPolicy::Value, "phantasy");
    let report = c.run_cycle_at(now).await;

    assert_eq!(report.targets, vec!["phantasy".to_string()]);
    assert_eq!(report.teardowns.len(), 2);
    assert!(report
        .teardowns
        .iter()
        .all(|t| t.reason.as_str() == "parameter_mismatch"));
    assert!(sim.running_jobs().iter().all(|j| j.target_id == "phantasy"));
    assert!(c.ledger().iter().all(|j| j.target_id == "phantasy"));
}

#[tokio::test]
async fn unknown_target_skips_only_that_pass() {
    let sim = fleet(&[("home", 64.0)]);
    sim.set_choice(TargetPolicy::Value, "ghost");
    let mut c = controller(&sim, config(0.05, 0.9));

    let report = c.run_cycle_at(sim.now()).await;

    assert!(report.outcomes.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        report.errors[0].plan_error(),
        Some(&PlanError::UnknownTarget("ghost".to_string()))
    );
    assert_eq!(report.next_pass_in, Duration::from_secs(1));
}

#[tokio::test]
async fn secondary_target_runs_alongside_primary() {
    let sim = fleet(&[("home", 256.0)]);
    sim.add_target(target("phantasy", 1_000_000.0, 5.0));
    sim.set_choice(TargetPolicy::Throughput, "phantasy");
    let config = BatchConfig {
        max_targets: 2,
        ..config(0.05, 0.9)
    };
    let mut c = controller(&sim, config);

    let report = c.run_cycle_at(sim.now()).await;

    let targets: Vec<&str> = report.outcomes.iter().map(|o| o.target_id.as_str()).collect();
    assert_eq!(targets, vec!["joesguns", "phantasy"]);
    assert_eq!(sim.running_jobs().len(), 4);
}

#[tokio::test]
async fn prep_pass_brings_target_to_floor_then_batches() {
    let sim = fleet(&[("home", 10_000.0)]);
    sim.add_target(target("joesguns", 500_000.0, 10.0));
    let mut c = controller(&sim, config(0.05, 1.0));

    let prep = c.run_cycle_at(sim.now()).await;
    let outcome = &prep.outcomes[0];
    assert!(outcome.prep);
    assert!(!outcome.degraded);
    assert_eq!(outcome.groups.iter().find(|g| g.group == BatchGroup::Extract).unwrap().planned, 0);

    sim.advance(prep.next_pass_in);
    let after = sim.target("joesguns").unwrap();
    assert_eq!(after.defense_current, 5.0);
    assert_eq!(after.value_current, 1_000_000.0);

    let batch = c.run_cycle_at(sim.now()).await;
    let outcome = &batch.outcomes[0];
    assert!(!outcome.prep);
    assert!(outcome.expected_yield > 0.0);
    assert!(!outcome.to_json().unwrap().is_empty());
}
