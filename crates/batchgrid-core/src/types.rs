//! Shared types used across BatchGrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker host.
pub type HostId = String;

/// Unique identifier for a target.
pub type TargetId = String;

// ── Operations ─────────────────────────────────────────────────────

/// The three operation kinds a job can run against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Removes a fraction of the target's current value, raising its defense.
    Extract,
    /// Lowers the target's defense metric.
    Restore,
    /// Raises the target's current value toward its maximum, raising its defense.
    Grow,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [Self::Extract, Self::Restore, Self::Grow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Restore => "restore",
            Self::Grow => "grow",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four operation groups that make up a batch.
///
/// Two groups share the `Restore` kind; the group tells them apart so that
/// timing and allocation can address each one separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchGroup {
    Extract,
    Restore1,
    Grow,
    Restore2,
}

impl BatchGroup {
    pub const ALL: [BatchGroup; 4] = [Self::Extract, Self::Restore1, Self::Grow, Self::Restore2];

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Extract => OperationKind::Extract,
            Self::Restore1 | Self::Restore2 => OperationKind::Restore,
            Self::Grow => OperationKind::Grow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Restore1 => "restore1",
            Self::Grow => "grow",
            Self::Restore2 => "restore2",
        }
    }
}

impl fmt::Display for BatchGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Target ─────────────────────────────────────────────────────────

/// Point-in-time view of a target, taken fresh at the top of every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub target_id: TargetId,
    pub value_current: f64,
    pub value_max: f64,
    pub defense_current: f64,
    pub defense_min: f64,
    pub growth_factor: f64,
    /// Probability in 0..=1 that a single extraction succeeds.
    pub extract_success_chance: f64,
    /// Actor skill needed before extraction has any effect.
    pub required_skill: f64,
}

impl TargetSnapshot {
    /// `value_current / value_max`, clamped to 1.0. Zero for empty targets.
    pub fn value_ratio(&self) -> f64 {
        if self.value_max > 0.0 {
            (self.value_current / self.value_max).min(1.0)
        } else {
            0.0
        }
    }

    /// Defense above the floor, never negative.
    pub fn excess_defense(&self) -> f64 {
        (self.defense_current - self.defense_min).max(0.0)
    }

    /// Copy of this snapshot with defense at its floor.
    pub fn at_min_defense(&self) -> Self {
        Self {
            defense_current: self.defense_min,
            ..self.clone()
        }
    }

    /// Whether the target sits at minimum defense (within `slack`) with
    /// at least `value_floor` of its maximum value.
    pub fn is_prepped(&self, defense_slack: f64, value_floor: f64) -> bool {
        self.defense_current <= self.defense_min + defense_slack
            && self.value_ratio() >= value_floor
    }
}

/// What the acting entity brings to every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorCapability {
    pub skill: f64,
    pub extract_mult: f64,
    pub grow_mult: f64,
    pub speed_mult: f64,
    pub cores: u32,
}

impl Default for ActorCapability {
    fn default() -> Self {
        Self {
            skill: 1.0,
            extract_mult: 1.0,
            grow_mult: 1.0,
            speed_mult: 1.0,
            cores: 1,
        }
    }
}

// ── Hosts ──────────────────────────────────────────────────────────

/// Capacity record for one worker host, refreshed every allocation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub host_id: HostId,
    pub max_capacity: f64,
    pub used_capacity: f64,
    /// Policy floor that must stay unallocated.
    pub reserved_capacity: f64,
}

impl HostCapacity {
    pub fn new(host_id: &str, max_capacity: f64, used_capacity: f64) -> Self {
        Self {
            host_id: host_id.to_string(),
            max_capacity,
            used_capacity,
            reserved_capacity: 0.0,
        }
    }

    /// `max - used - reserved`, never negative.
    pub fn free_capacity(&self) -> f64 {
        (self.max_capacity - self.used_capacity - self.reserved_capacity).max(0.0)
    }

    /// Raise the reserve to at least `floor`.
    pub fn with_reserve(mut self, floor: f64) -> Self {
        self.reserved_capacity = self.reserved_capacity.max(floor);
        self
    }
}

// ── Jobs ───────────────────────────────────────────────────────────

/// Opaque handle to a launched job, assigned by the launch collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A job as reported by the process-inventory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub handle: JobHandle,
    pub host_id: HostId,
    pub kind: OperationKind,
    pub target_id: TargetId,
    pub threads: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(value: f64, max: f64, defense: f64, min: f64) -> TargetSnapshot {
        TargetSnapshot {
            target_id: "n00dles".to_string(),
            value_current: value,
            value_max: max,
            defense_current: defense,
            defense_min: min,
            growth_factor: 20.0,
            extract_success_chance: 1.0,
            required_skill: 1.0,
        }
    }

    #[test]
    fn free_capacity_subtracts_used_and_reserved() {
        let host = HostCapacity::new("home", 64.0, 16.0).with_reserve(8.0);
        assert_eq!(host.free_capacity(), 40.0);
    }

    #[test]
    fn free_capacity_clamps_at_zero() {
        let host = HostCapacity::new("home", 8.0, 6.0).with_reserve(4.0);
        assert_eq!(host.free_capacity(), 0.0);
    }

    #[test]
    fn with_reserve_keeps_larger_reported_reserve() {
        let mut host = HostCapacity::new("home", 64.0, 0.0);
        host.reserved_capacity = 16.0;
        assert_eq!(host.with_reserve(8.0).reserved_capacity, 16.0);
    }

    #[test]
    fn value_ratio_tolerates_overfull_and_empty_targets() {
        assert_eq!(snapshot(2000.0, 1000.0, 1.0, 1.0).value_ratio(), 1.0);
        assert_eq!(snapshot(0.0, 0.0, 1.0, 1.0).value_ratio(), 0.0);
    }

    #[test]
    fn prepped_requires_min_defense_and_value_floor() {
        assert!(snapshot(1000.0, 1000.0, 1.0, 1.0).is_prepped(0.0, 1.0));
        assert!(!snapshot(1000.0, 1000.0, 1.5, 1.0).is_prepped(0.0, 1.0));
        assert!(snapshot(1000.0, 1000.0, 1.5, 1.0).is_prepped(0.5, 1.0));
        assert!(!snapshot(800.0, 1000.0, 1.0, 1.0).is_prepped(0.0, 0.9));
    }

    #[test]
    fn groups_map_to_kinds() {
        assert_eq!(BatchGroup::Restore1.kind(), OperationKind::Restore);
        assert_eq!(BatchGroup::Restore2.kind(), OperationKind::Restore);
        assert_eq!(BatchGroup::Grow.kind(), OperationKind::Grow);
        assert_eq!(BatchGroup::Extract.kind(), OperationKind::Extract);
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&OperationKind::Restore).unwrap();
        assert_eq!(json, "\"restore\"");
        let group: BatchGroup = serde_json::from_str("\"restore2\"").unwrap();
        assert_eq!(group, BatchGroup::Restore2);
    }
}
