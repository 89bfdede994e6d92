//! Admission control for new workers.
//!
//! Model workers share a host-sized pool. Param-finder workers have no global
//! ceiling but at most one worker per id.

use sysinfo::System;
use tracing::{info, warn};

use crate::error::WorkerError;

const GIB: u64 = 1 << 30;

/// Lower bound on the pool size, whatever the host looks like.
pub const MIN_POOL_CAPACITY: usize = 2;

/// `max(min(cpus - 1, floor(mem / 1 GiB)), 2)`
pub fn pool_capacity(num_cpus: usize, total_memory_bytes: u64) -> usize {
    let by_cpu = num_cpus.saturating_sub(1);
    let by_memory = usize::try_from(total_memory_bytes / GIB).unwrap_or(usize::MAX);
    by_cpu.min(by_memory).max(MIN_POOL_CAPACITY)
}

/// What the registry currently holds, as far as admission cares.
#[derive(Debug, Clone, Copy, Default)]
pub struct Occupancy {
    /// Number of active workers in the registry.
    pub active: usize,
    /// Whether the requested id is among them.
    pub id_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Global ceiling on concurrently active workers.
    Pool { capacity: usize },
    /// No ceiling; one active worker per id.
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn pool(capacity: usize) -> Self {
        Self {
            policy: AdmissionPolicy::Pool { capacity },
        }
    }

    pub fn exclusive() -> Self {
        Self {
            policy: AdmissionPolicy::Exclusive,
        }
    }

    /// Size the pool from this machine's CPUs and memory, unless overridden.
    pub fn for_host(capacity_override: Option<usize>) -> Self {
        if let Some(capacity) = capacity_override {
            let capacity = capacity.max(1);
            info!(capacity, "model pool capacity overridden");
            return Self::pool(capacity);
        }

        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not determine CPU count; assuming 1");
                1
            });
        let mut system = System::new();
        system.refresh_memory();
        let total_memory = system.total_memory();

        let capacity = pool_capacity(num_cpus, total_memory);
        info!(num_cpus, total_memory, capacity, "model pool capacity computed");
        Self::pool(capacity)
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Global ceiling, if the policy has one.
    pub fn capacity(&self) -> Option<usize> {
        match self.policy {
            AdmissionPolicy::Pool { capacity } => Some(capacity),
            AdmissionPolicy::Exclusive => None,
        }
    }

    pub fn available_slots(&self, occupancy: Occupancy) -> usize {
        match self.policy {
            AdmissionPolicy::Pool { capacity } => capacity.saturating_sub(occupancy.active),
            AdmissionPolicy::Exclusive => usize::from(!occupancy.id_active),
        }
    }

    /// Decide whether `id` may start. Capacity is checked before id reuse.
    pub fn admit(&self, id: &str, occupancy: Occupancy) -> Result<(), WorkerError> {
        if self.available_slots(occupancy) == 0 {
            warn!(worker_id = id, active = occupancy.active, "admission denied");
            return Err(WorkerError::MaximumConcurrency);
        }
        if occupancy.id_active {
            return Err(WorkerError::DuplicateId(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occ(active: usize, id_active: bool) -> Occupancy {
        Occupancy { active, id_active }
    }

    #[test]
    fn test_policy_reports_constructor() {
        assert_eq!(
            AdmissionController::pool(4).policy(),
            AdmissionPolicy::Pool { capacity: 4 }
        );
        assert_eq!(
            AdmissionController::exclusive().policy(),
            AdmissionPolicy::Exclusive
        );
        assert_eq!(
            AdmissionController::for_host(Some(3)).policy(),
            AdmissionPolicy::Pool { capacity: 3 }
        );
    }

    #[test]
    fn test_pool_capacity_small_host() {
        assert_eq!(pool_capacity(2, GIB), 2);
        assert_eq!(pool_capacity(1, 0), 2);
    }

    #[test]
    fn test_pool_capacity_bounded_by_cpu_and_memory() {
        assert_eq!(pool_capacity(8, 16 * GIB), 7);
        assert_eq!(pool_capacity(16, 4 * GIB), 4);
        // Partial gigabytes do not count.
        assert_eq!(pool_capacity(16, 5 * GIB + GIB / 2), 5);
    }

    #[test]
    fn test_pool_denies_when_full() {
        let admission = AdmissionController::pool(2);
        assert_eq!(admission.available_slots(occ(1, false)), 1);
        assert!(admission.admit("c", occ(1, false)).is_ok());
        assert_eq!(
            admission.admit("c", occ(2, false)),
            Err(WorkerError::MaximumConcurrency)
        );
    }

    #[test]
    fn test_pool_checks_capacity_before_duplicate() {
        let admission = AdmissionController::pool(1);
        assert_eq!(
            admission.admit("a", occ(1, true)),
            Err(WorkerError::MaximumConcurrency)
        );
        let admission = AdmissionController::pool(3);
        assert_eq!(
            admission.admit("a", occ(1, true)),
            Err(WorkerError::DuplicateId("a".to_string()))
        );
    }

    #[test]
    fn test_exclusive_has_no_global_ceiling() {
        let admission = AdmissionController::exclusive();
        assert_eq!(admission.capacity(), None);
        assert!(admission.admit("m2", occ(500, false)).is_ok());
        assert_eq!(admission.available_slots(occ(500, false)), 1);
    }

    #[test]
    fn test_exclusive_one_per_id() {
        let admission = AdmissionController::exclusive();
        assert_eq!(admission.available_slots(occ(1, true)), 0);
        assert_eq!(
            admission.admit("m1", occ(1, true)),
            Err(WorkerError::MaximumConcurrency)
        );
    }

    #[test]
    fn test_override_is_at_least_one() {
        assert_eq!(AdmissionController::for_host(Some(0)).capacity(), Some(1));
        assert_eq!(AdmissionController::for_host(Some(5)).capacity(), Some(5));
    }
}
