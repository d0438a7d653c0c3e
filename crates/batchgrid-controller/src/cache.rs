//! Per-pass host cache.
//!
//! The usable host list is refreshed exactly once at the top of every pass
//! and never consulted across passes. Capacity is not cached: it is read
//! fresh from the capacity collaborator each time the allocator needs it,
//! then the reserve policy is applied.

use tracing::debug;

use batchgrid_core::{HostCapacity, HostId, ReservePolicy};

use crate::fleet::{CapacitySource, HostDirectory};

#[derive(Debug, Clone, Default)]
pub struct HostCache {
    hosts: Vec<HostId>,
}

impl HostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enumerate hosts, keeping only those we have access to.
    pub fn refresh<D: HostDirectory + ?Sized>(&mut self, directory: &D) {
        let listed = directory.list_hosts();
        let total = listed.len();
        let mut hosts: Vec<HostId> = listed
            .into_iter()
            .filter(|h| directory.has_access(h))
            .collect();
        hosts.sort();
        hosts.dedup();

        debug!(listed = total, usable = hosts.len(), "host cache refreshed");
        self.hosts = hosts;
    }

    pub fn hosts(&self) -> &[HostId] {
        &self.hosts
    }

    /// Current capacity of every cached host with its reserve applied.
    /// Hosts the capacity collaborator no longer knows are skipped.
    pub fn capacities<C: CapacitySource + ?Sized>(
        &self,
        source: &C,
        reserve: &ReservePolicy,
    ) -> Vec<HostCapacity> {
        self.hosts
            .iter()
            .filter_map(|h| source.host_capacity(h))
            .map(|c| {
                let floor = reserve.for_host(&c.host_id);
                c.with_reserve(floor)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use super::*;

    struct StaticHosts {
        listed: Vec<&'static str>,
        rooted: HashSet<&'static str>,
        capacity: BTreeMap<&'static str, (f64, f64)>,
    }

    impl HostDirectory for StaticHosts {
        fn list_hosts(&self) -> Vec<HostId> {
            self.listed.iter().map(|s| s.to_string()).collect()
        }

        fn has_access(&self, host_id: &str) -> bool {
            self.rooted.contains(host_id)
        }
    }

    impl CapacitySource for StaticHosts {
        fn host_capacity(&self, host_id: &str) -> Option<HostCapacity> {
            self.capacity
                .get(host_id)
                .map(|(max, used)| HostCapacity::new(host_id, *max, *used))
        }
    }

    fn fixture() -> StaticHosts {
        StaticHosts {
            listed: vec!["sigma", "home", "n00dles", "home", "csec"],
            rooted: ["home", "sigma", "n00dles"].into_iter().collect(),
            capacity: [("home", (64.0, 4.0)), ("sigma", (32.0, 0.0))].into_iter().collect(),
        }
    }

    #[test]
    fn refresh_filters_by_access_and_sorts() {
        let mut cache = HostCache::new();
        cache.refresh(&fixture());

        assert_eq!(cache.hosts(), &["home", "n00dles", "sigma"]);
    }

    #[test]
    fn refresh_replaces_previous_host_list() {
        let mut fleet = fixture();
        let mut cache = HostCache::new();
        cache.refresh(&fleet);

        fleet.rooted.remove("sigma");
        cache.refresh(&fleet);

        assert_eq!(cache.hosts(), &["home", "n00dles"]);
    }

    #[test]
    fn capacities_apply_reserve_and_skip_unknown_hosts() {
        let fleet = fixture();
        let mut cache = HostCache::new();
        cache.refresh(&fleet);

        let reserve = ReservePolicy {
            default: 0.0,
            hosts: [("home".to_string(), 16.0)].into_iter().collect(),
        };
        let caps = cache.capacities(&fleet, &reserve);

        // n00dles has no capacity record.
        assert_eq!(caps.len(), 2);
        let home = caps.iter().find(|c| c.host_id == "home").unwrap();
        assert_eq!(home.free_capacity(), 44.0);
        let sigma = caps.iter().find(|c| c.host_id == "sigma").unwrap();
        assert_eq!(sigma.free_capacity(), 32.0);
    }
}
