//! Fleet scenarios for `plan`, `simulate` and `run`.
//!
//! ```toml
//! primary = "joesguns"
//!
//! [actor]
//! skill = 120.0
//! extract_mult = 1.0
//! grow_mult = 1.0
//! speed_mult = 1.0
//! cores = 1
//!
//! [[hosts]]
//! id = "home"
//! max_capacity = 256.0
//!
//! [[targets]]
//! target_id = "joesguns"
//! value_current = 2500000.0
//! ...
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use batchgrid_controller::{SimFleet, TargetPolicy};
use batchgrid_core::{
    ActorCapability, HostCapacity, HostId, OperationModel, ReservePolicy, TargetId, TargetSnapshot, ThreadCost,
};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioHost {
    pub id: HostId,
    pub max_capacity: f64,
    #[serde(default)]
    pub used_capacity: f64,
    #[serde(default = "yes")]
    pub payload: bool,
    #[serde(default = "yes")]
    pub access: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub actor: ActorCapability,
    pub hosts: Vec<ScenarioHost>,
    pub targets: Vec<TargetSnapshot>,
    pub primary: Option<TargetId>,
    pub secondary: Option<TargetId>,
    /// Hosts whose launches are rejected, to exercise backoff.
    pub failing_hosts: Vec<HostId>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing scenario {}", path.display()))
    }

    /// A home server, a few purchased servers and two prepped targets.
    pub fn builtin() -> Self {
        let host = |id: &str, max_capacity: f64| ScenarioHost {
            id: id.to_string(),
            max_capacity,
            used_capacity: 0.0,
            payload: true,
            access: true,
        };
        Self {
            actor: ActorCapability {
                skill: 250.0,
                ..ActorCapability::default()
            },
            hosts: vec![
                host("home", 512.0),
                host("pserv-0", 256.0),
                host("pserv-1", 256.0),
                host("n00dles", 4.0),
            ],
            targets: vec![
                TargetSnapshot {
                    target_id: "phantasy".to_string(),
                    value_current: 24_000_000.0,
                    value_max: 24_000_000.0,
                    defense_current: 20.0,
                    defense_min: 20.0,
                    growth_factor: 20.0,
                    extract_success_chance: 0.85,
                    required_skill: 100.0,
                },
                TargetSnapshot {
                    target_id: "joesguns".to_string(),
                    value_current: 1_500_000.0,
                    value_max: 2_500_000.0,
                    defense_current: 15.0,
                    defense_min: 5.0,
                    growth_factor: 20.0,
                    extract_success_chance: 0.95,
                    required_skill: 10.0,
                },
            ],
            primary: Some("phantasy".to_string()),
            secondary: Some("joesguns".to_string()),
            failing_hosts: Vec::new(),
        }
    }

    pub fn target(&self, target_id: &str) -> Option<&TargetSnapshot> {
        self.targets.iter().find(|t| t.target_id == target_id)
    }

    /// Capacity of every accessible host as the allocator would see it.
    pub fn capacities(&self, reserve: &ReservePolicy) -> Vec<HostCapacity> {
        self.hosts
            .iter()
            .filter(|h| h.access)
            .map(|h| HostCapacity::new(&h.id, h.max_capacity, h.used_capacity).with_reserve(reserve.for_host(&h.id)))
            .collect()
    }

    /// Simulated fleet populated from this scenario.
    pub fn build_fleet<M>(&self, model: M, thread_cost: ThreadCost) -> SimFleet
    where
        M: OperationModel + Send + Sync + 'static,
    {
        let fleet = SimFleet::new(self.actor.clone())
            .with_model(model)
            .with_thread_cost(thread_cost);
        for h in &self.hosts {
            fleet.add_host(&h.id, h.max_capacity);
            fleet.set_used_capacity(&h.id, h.used_capacity);
            fleet.set_payload(&h.id, h.payload);
            fleet.set_access(&h.id, h.access);
        }
        for t in &self.targets {
            fleet.add_target(t.clone());
        }
        if let Some(primary) = &self.primary {
            fleet.set_choice(TargetPolicy::Value, primary);
        }
        if let Some(secondary) = &self.secondary {
            fleet.set_choice(TargetPolicy::Throughput, secondary);
        }
        for h in &self.failing_hosts {
            fleet.fail_launches_on(h);
        }
        fleet
    }
}
