//! Worker-pool allocator: spreads each group's threads across hosts.
//!
//! Groups are processed in landing order so the most timing-critical
//! group gets first pick. For each group the allocator repeatedly takes
//! the eligible host with the most free capacity (ties broken by host id)
//! and assigns as many threads as fit, until the group is satisfied or no
//! host can take another thread.
//!
//! Falling short is not an error: the result reports `assigned` vs
//! `requested` per group and the pass is treated as degraded.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use batchgrid_core::{BatchGroup, HostCapacity, HostId, OperationKind, TargetId};
use batchgrid_planner::BatchPlan;

/// Free capacity per host, owned by the allocator for one pass.
#[derive(Debug, Clone)]
pub struct FreeCapacity {
    free: BTreeMap<HostId, f64>,
}

impl FreeCapacity {
    /// Snapshot free capacity, leaving out `blocked` hosts entirely.
    pub fn new(hosts: &[HostCapacity], blocked: &HashSet<HostId>) -> Self {
        let free = hosts
            .iter()
            .filter(|h| !blocked.contains(&h.host_id))
            .map(|h| (h.host_id.clone(), h.free_capacity()))
            .collect();
        Self { free }
    }

    pub fn free(&self, host_id: &str) -> f64 {
        self.free.get(host_id).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.free.values().sum()
    }

    /// Threads of `cost` each that fit across all hosts, host by host.
    pub fn thread_capacity(&self, cost: f64) -> u64 {
        if cost <= 0.0 {
            return 0;
        }
        self.free.values().map(|free| (free / cost).floor() as u64).sum()
    }

    /// Host with the most room for at least one thread of `cost`.
    fn best_host(&self, cost: f64) -> Option<(HostId, f64)> {
        let mut best: Option<(&HostId, f64)> = None;
        for (host, &free) in &self.free {
            if free < cost {
                continue;
            }
            // BTreeMap order means the first of equal hosts wins the tie.
            if best.is_none_or(|(_, top)| free > top) {
                best = Some((host, free));
            }
        }
        best.map(|(h, f)| (h.clone(), f))
    }

    /// Assign up to `requested` threads of `cost` each for `group`.
    pub fn take(&mut self, group: BatchGroup, requested: u32, cost: f64) -> GroupAllocation {
        let mut alloc = GroupAllocation {
            group,
            kind: group.kind(),
            requested,
            assigned: 0,
            hosts: Vec::new(),
        };
        if requested == 0 || cost <= 0.0 {
            return alloc;
        }

        while alloc.assigned < requested {
            let Some((host, free)) = self.best_host(cost) else {
                break;
            };
            let fits = (free / cost).floor().min(f64::from(u32::MAX)) as u32;
            let threads = fits.min(requested - alloc.assigned);
            if threads == 0 {
                break;
            }

            if let Some(slot) = self.free.get_mut(&host) {
                *slot = (*slot - f64::from(threads) * cost).max(0.0);
            }
            debug!(%host, %group, threads, free_before = free, "assigned threads");
            alloc.assigned += threads;
            alloc.hosts.push((host, threads));
        }
        alloc
    }
}

/// Threads assigned to hosts for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAllocation {
    pub group: BatchGroup,
    pub kind: OperationKind,
    pub requested: u32,
    pub assigned: u32,
    /// Host-id → threads, in the order hosts were picked.
    pub hosts: Vec<(HostId, u32)>,
}

impl GroupAllocation {
    pub fn is_satisfied(&self) -> bool {
        self.assigned >= self.requested
    }
}

/// Allocation of one batch plan across the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub target_id: TargetId,
    /// Per-group results, in the order groups were allocated.
    pub groups: Vec<GroupAllocation>,
}

impl Allocation {
    pub fn group(&self, group: BatchGroup) -> Option<&GroupAllocation> {
        self.groups.iter().find(|g| g.group == group)
    }

    pub fn assigned(&self, group: BatchGroup) -> u32 {
        self.group(group).map(|g| g.assigned).unwrap_or(0)
    }

    pub fn requested(&self, group: BatchGroup) -> u32 {
        self.group(group).map(|g| g.requested).unwrap_or(0)
    }

    pub fn total_assigned(&self) -> u64 {
        self.groups.iter().map(|g| u64::from(g.assigned)).sum()
    }

    pub fn total_requested(&self) -> u64 {
        self.groups.iter().map(|g| u64::from(g.requested)).sum()
    }

    /// Some group received fewer threads than it asked for.
    pub fn degraded(&self) -> bool {
        self.groups.iter().any(|g| !g.is_satisfied())
    }

    /// Every `(host, group, threads)` triple to launch.
    pub fn assignments(&self) -> impl Iterator<Item = (&HostId, BatchGroup, u32)> {
        self.groups
            .iter()
            .flat_map(|g| g.hosts.iter().map(move |(h, t)| (h, g.group, *t)))
    }
}

/// Allocate every group of `plan`, in `order`, across `hosts`.
///
/// Hosts in `blocked` (under backoff) are skipped regardless of their
/// reported free capacity.
pub fn allocate(
    plan: &BatchPlan,
    order: &[BatchGroup],
    hosts: &[HostCapacity],
    blocked: &HashSet<HostId>,
) -> Allocation {
    let mut capacity = FreeCapacity::new(hosts, blocked);
    let fleet_free = capacity.total();
    let groups: Vec<GroupAllocation> = order
        .iter()
        .map(|group| {
            let cost = plan.ram_per_thread(group.kind());
            capacity.take(*group, plan.threads(*group), cost)
        })
        .collect();

    let allocation = Allocation {
        target_id: plan.target_id.clone(),
        groups,
    };

    if allocation.degraded() {
        warn!(
            target = %allocation.target_id,
            assigned = allocation.total_assigned(),
            requested = allocation.total_requested(),
            free = fleet_free,
            "partial allocation: fleet capacity short"
        );
    }
    allocation
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use batchgrid_core::ThreadCost;
    use batchgrid_planner::OperationDurations;

    fn host(id: &str, free: f64) -> HostCapacity {
        HostCapacity::new(id, free, 0.0)
    }

    fn unit_plan(extract: u32, restore1: u32, grow: u32, restore2: u32) -> BatchPlan {
        BatchPlan {
            target_id: "phantasy".to_string(),
            prep: false,
            extract_threads: extract,
            restore_threads1: restore1,
            grow_threads: grow,
            restore_threads2: restore2,
            extracted_fraction: 0.1,
            value_after_extract: 900.0,
            grow_goal: 1000.0,
            expected_yield: 100.0,
            grow_capped: false,
            durations: OperationDurations {
                extract: Duration::from_secs(10),
                restore: Duration::from_secs(40),
                grow: Duration::from_secs(32),
            },
            thread_cost: ThreadCost {
                extract: 1.0,
                restore: 1.0,
                grow: 1.0,
            },
        }
    }

    #[test]
    fn splits_group_across_two_hosts() {
        let hosts = vec![host("a", 10.0), host("b", 3.0)];
        let mut capacity = FreeCapacity::new(&hosts, &HashSet::new());

        let alloc = capacity.take(BatchGroup::Extract, 12, 1.0);

        assert_eq!(alloc.hosts, vec![("a".to_string(), 10), ("b".to_string(), 2)]);
        assert_eq!(alloc.assigned, 12);
        assert!(alloc.is_satisfied());
    }

    #[test]
    fn single_small_host_is_partial() {
        let hosts = vec![host("a", 5.0)];
        let plan = unit_plan(12, 0, 0, 0);

        let alloc = allocate(&plan, &[BatchGroup::Extract], &hosts, &HashSet::new());

        assert_eq!(alloc.assigned(BatchGroup::Extract), 5);
        assert_eq!(alloc.requested(BatchGroup::Extract), 12);
        assert!(alloc.degraded());
    }

    #[test]
    fn ties_break_by_host_id() {
        let hosts = vec![host("zeta", 4.0), host("alpha", 4.0)];
        let mut capacity = FreeCapacity::new(&hosts, &HashSet::new());
        let alloc = capacity.take(BatchGroup::Grow, 2, 1.0);
        assert_eq!(alloc.hosts, vec![("alpha".to_string(), 2)]);
    }

    #[test]
    fn host_below_one_thread_is_ineligible() {
        let hosts = vec![host("tiny", 1.5)];
        let mut capacity = FreeCapacity::new(&hosts, &HashSet::new());
        let alloc = capacity.take(BatchGroup::Restore1, 3, 1.75);
        assert_eq!(alloc.assigned, 0);
        assert!(alloc.hosts.is_empty());
    }

    #[test]
    fn blocked_hosts_are_skipped() {
        let hosts = vec![host("a", 100.0), host("b", 3.0)];
        let blocked: HashSet<HostId> = ["a".to_string()].into_iter().collect();
        let plan = unit_plan(5, 0, 0, 0);

        let alloc = allocate(&plan, &[BatchGroup::Extract], &hosts, &blocked);

        assert_eq!(alloc.assigned(BatchGroup::Extract), 3);
        assert!(alloc.assignments().all(|(h, _, _)| h == "b"));
    }

    #[test]
    fn earlier_groups_get_first_pick() {
        let hosts = vec![host("big", 8.0), host("small", 4.0)];
        let plan = unit_plan(2, 8, 0, 0);
        let order = [BatchGroup::Restore1, BatchGroup::Extract];

        let alloc = allocate(&plan, &order, &hosts, &HashSet::new());

        assert_eq!(alloc.group(BatchGroup::Restore1).unwrap().hosts, vec![("big".to_string(), 8)]);
        assert_eq!(alloc.group(BatchGroup::Extract).unwrap().hosts, vec![("small".to_string(), 2)]);
        assert!(!alloc.degraded());
    }

    #[test]
    fn never_exceeds_free_capacity_or_request() {
        let hosts = vec![
            HostCapacity::new("home", 64.0, 20.0).with_reserve(8.0),
            host("n00dles", 4.0),
            host("sigma", 32.0),
            host("omega", 7.0),
        ];
        let mut plan = unit_plan(9, 3, 30, 4);
        plan.thread_cost = ThreadCost::default();
        let order = BatchGroup::ALL;

        let alloc = allocate(&plan, &order, &hosts, &HashSet::new());

        for g in &alloc.groups {
            assert!(g.assigned <= g.requested);
            let sum: u32 = g.hosts.iter().map(|(_, t)| t).sum();
            assert_eq!(sum, g.assigned);
        }
        for h in &hosts {
            let used: f64 = alloc
                .assignments()
                .filter(|(id, _, _)| **id == h.host_id)
                .map(|(_, g, t)| f64::from(t) * plan.ram_per_thread(g.kind()))
                .sum();
            assert!(used <= h.free_capacity() + 1e-9, "host {} over-allocated", h.host_id);
        }
    }

    #[test]
    fn thread_capacity_counts_per_host_floors() {
        let hosts = vec![host("a", 3.5), host("b", 3.5)];
        let capacity = FreeCapacity::new(&hosts, &HashSet::new());
        assert_eq!(capacity.thread_capacity(1.75), 4);
        assert_eq!(capacity.thread_capacity(2.0), 2);
        assert_eq!(capacity.total(), 7.0);
    }
}
