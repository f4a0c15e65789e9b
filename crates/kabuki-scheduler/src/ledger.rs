//! Reversible capacity snapshots for one machine
//!
//! A [`MachineLedger`] is an arena of snapshots, one per outstanding
//! reservation. Host-level fields are copied into every snapshot. The
//! accelerator array is owned once by the ledger; a reservation replaces
//! only the slot it touches and keeps the slot's prior value as its undo
//! entry, so releasing the newest reservation is a constant-time pop.

use kabuki_core::{JobRequirement, KabukiError, KabukiResult, ResourceReading};

/// Stable handle of one reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

/// Capacity left on one accelerator
#[derive(Debug, Clone, PartialEq)]
pub struct GpuState {
    /// Free memory in MiB
    pub free_memory: i64,
    pub utilization_fraction: f64,
    /// Reservations holding this accelerator exclusively
    pub reserved_count: u32,
}

/// Host-level capacity left on a machine
#[derive(Debug, Clone, PartialEq)]
pub struct HostState {
    pub cpu_usage_fraction: f64,
    /// Free memory in MiB
    pub free_memory: i64,
    pub cpu_count: u32,
    /// Reservations holding this host exclusively
    pub reserved_count: u32,
}

/// Borrowed view of a machine's current state
#[derive(Debug, Clone, Copy)]
pub struct MachineView<'a> {
    pub host: &'a HostState,
    pub accelerators: &'a [GpuState],
}

#[derive(Debug, Clone)]
struct Snapshot {
    id: ReservationId,
    host: HostState,
    requirement: JobRequirement,
    accelerator: Option<usize>,
    /// Value of the touched accelerator slot before this reservation
    undo: Option<GpuState>,
    /// Address of the accelerator array when the snapshot was taken
    array_identity: usize,
}

/// Snapshot chain of one machine
#[derive(Debug)]
pub struct MachineLedger {
    base: HostState,
    accelerators: Vec<GpuState>,
    snapshots: Vec<Snapshot>,
    next_id: u64,
}

impl Clone for MachineLedger {
    fn clone(&self) -> Self {
        let accelerators = self.accelerators.clone();
        let identity = accelerators.as_ptr() as usize;
        let snapshots = self
            .snapshots
            .iter()
            .map(|s| Snapshot {
                array_identity: identity,
                ..s.clone()
            })
            .collect();
        Self {
            base: self.base.clone(),
            accelerators,
            snapshots,
            next_id: self.next_id,
        }
    }
}

impl MachineLedger {
    /// Ledger whose base snapshot is the probed reading.
    pub fn from_reading(reading: &ResourceReading) -> Self {
        Self {
            base: HostState {
                cpu_usage_fraction: reading.cpu_usage_fraction,
                free_memory: reading.free_memory_mib(),
                cpu_count: reading.cpu_count,
                reserved_count: 0,
            },
            accelerators: reading
                .accelerators
                .iter()
                .map(|a| GpuState {
                    free_memory: a.free_memory,
                    utilization_fraction: a.utilization_fraction,
                    reserved_count: 0,
                })
                .collect(),
            snapshots: Vec::new(),
            next_id: 0,
        }
    }

    /// Current head snapshot
    pub fn view(&self) -> MachineView<'_> {
        MachineView {
            host: self.host(),
            accelerators: &self.accelerators,
        }
    }

    pub fn host(&self) -> &HostState {
        self.snapshots
            .last()
            .map(|s| &s.host)
            .unwrap_or(&self.base)
    }

    pub fn accelerators(&self) -> &[GpuState] {
        &self.accelerators
    }

    /// Number of outstanding reservations
    pub fn depth(&self) -> usize {
        self.snapshots.len()
    }

    /// Add one instance of `requirement` on top of the current head.
    ///
    /// `accelerator` is only consulted when the requirement wants one.
    pub fn reserve(
        &mut self,
        requirement: &JobRequirement,
        accelerator: Option<usize>,
    ) -> KabukiResult<ReservationId> {
        let id = ReservationId(self.next_id);
        self.next_id += 1;
        self.apply(id, requirement.clone(), accelerator)?;
        Ok(id)
    }

    /// Give back a reservation.
    ///
    /// The newest reservation is popped directly. An older one (jobs finish
    /// in any order) is removed by unwinding to its parent and replaying the
    /// reservations made after it, which keep their identifiers.
    pub fn release(&mut self, id: ReservationId) -> KabukiResult<()> {
        let position = self
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| KabukiError::Internal(format!("unknown reservation {:?}", id)))?;

        let mut later = Vec::with_capacity(self.snapshots.len() - position - 1);
        while self.snapshots.len() > position + 1 {
            later.push(self.pop()?);
        }
        self.pop()?;
        for snapshot in later.into_iter().rev() {
            self.apply(snapshot.id, snapshot.requirement, snapshot.accelerator)?;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        id: ReservationId,
        requirement: JobRequirement,
        accelerator: Option<usize>,
    ) -> KabukiResult<()> {
        let mut host = self.host().clone();
        if requirement.exclusive_host {
            host.reserved_count += 1;
        }
        host.cpu_usage_fraction += requirement.cpu_share / f64::from(host.cpu_count.max(1));
        host.free_memory -= requirement.memory_mib;

        let accelerator = accelerator.filter(|_| requirement.wants_accelerator);
        let undo = match accelerator {
            Some(idx) => {
                let slot = self.accelerators.get_mut(idx).ok_or_else(|| {
                    KabukiError::Internal(format!("accelerator {} does not exist", idx))
                })?;
                let prior = slot.clone();
                slot.free_memory -= requirement.accelerator_memory;
                slot.utilization_fraction += requirement.accelerator_utilization;
                if requirement.exclusive_accelerator {
                    slot.reserved_count += 1;
                }
                Some(prior)
            }
            None => None,
        };

        self.snapshots.push(Snapshot {
            id,
            host,
            requirement,
            accelerator,
            undo,
            array_identity: self.accelerators.as_ptr() as usize,
        });
        Ok(())
    }

    fn pop(&mut self) -> KabukiResult<Snapshot> {
        let snapshot = self
            .snapshots
            .pop()
            .ok_or_else(|| KabukiError::Internal("release on an empty ledger".to_string()))?;
        if snapshot.array_identity != self.accelerators.as_ptr() as usize {
            return Err(KabukiError::Internal(
                "accelerator array was replaced while reservations were outstanding".to_string(),
            ));
        }
        if let (Some(idx), Some(prior)) = (snapshot.accelerator, snapshot.undo.clone()) {
            self.accelerators[idx] = prior;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabuki_core::AcceleratorReading;

    fn example_reading() -> ResourceReading {
        ResourceReading {
            cpu_usage_fraction: 0.124,
            free_memory_kb: 30607 * 1024,
            cpu_count: 24,
            accelerators: vec![
                AcceleratorReading {
                    name: "GeForce RTX 2060".to_string(),
                    total_memory: 5934,
                    free_memory: 5933,
                    utilization_fraction: 0.0,
                },
                AcceleratorReading {
                    name: "GeForce RTX 2060".to_string(),
                    total_memory: 5932,
                    free_memory: 5931,
                    utilization_fraction: 0.0,
                },
            ],
        }
    }

    fn shared_job() -> JobRequirement {
        JobRequirement {
            cpu_share: 8.0,
            memory_mib: 2000,
            wants_accelerator: true,
            accelerator_memory: 1000,
            accelerator_utilization: 0.3,
            exclusive_host: false,
            exclusive_accelerator: false,
        }
    }

    #[test]
    fn test_reserve_updates_head() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        ledger.reserve(&shared_job(), Some(1)).unwrap();

        let view = ledger.view();
        assert!((view.host.cpu_usage_fraction - (0.124 + 8.0 / 24.0)).abs() < 1e-12);
        assert_eq!(view.host.free_memory, 28607);
        assert_eq!(view.accelerators[0].free_memory, 5933);
        assert_eq!(view.accelerators[1].free_memory, 4931);
        assert!((view.accelerators[1].utilization_fraction - 0.3).abs() < 1e-12);
        assert_eq!(view.accelerators[1].reserved_count, 0);
    }

    #[test]
    fn test_exclusive_flags_count_reservations() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let job = JobRequirement {
            exclusive_host: true,
            exclusive_accelerator: true,
            ..shared_job()
        };
        ledger.reserve(&job, Some(0)).unwrap();
        ledger.reserve(&job, Some(0)).unwrap();
        assert_eq!(ledger.host().reserved_count, 2);
        assert_eq!(ledger.accelerators()[0].reserved_count, 2);
    }

    #[test]
    fn test_cpu_only_job_leaves_accelerators_alone() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let job = JobRequirement {
            wants_accelerator: false,
            ..shared_job()
        };
        ledger.reserve(&job, Some(0)).unwrap();
        let untouched = MachineLedger::from_reading(&example_reading());
        assert_eq!(ledger.accelerators(), untouched.accelerators());
    }

    #[test]
    fn test_release_in_reverse_order_restores_base() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let before = ledger.clone();
        let ids: Vec<_> = [0, 1, 1, 0]
            .iter()
            .map(|&acc| ledger.reserve(&shared_job(), Some(acc)).unwrap())
            .collect();
        for id in ids.into_iter().rev() {
            ledger.release(id).unwrap();
        }
        assert_eq!(ledger.host(), before.host());
        assert_eq!(ledger.accelerators(), before.accelerators());
        assert_eq!(ledger.depth(), 0);
    }

    #[test]
    fn test_release_out_of_order_replays_later_reservations() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let first = ledger.reserve(&shared_job(), Some(0)).unwrap();
        let second = ledger.reserve(&shared_job(), Some(1)).unwrap();
        let third = ledger.reserve(&shared_job(), Some(0)).unwrap();

        ledger.release(first).unwrap();
        assert_eq!(ledger.depth(), 2);
        assert_eq!(ledger.accelerators()[0].free_memory, 4933);
        assert_eq!(ledger.accelerators()[1].free_memory, 4931);
        assert_eq!(ledger.host().free_memory, 30607 - 4000);

        ledger.release(third).unwrap();
        ledger.release(second).unwrap();
        assert_eq!(ledger.accelerators()[0].free_memory, 5933);
        assert_eq!(ledger.accelerators()[1].free_memory, 5931);
        assert_eq!(ledger.host().free_memory, 30607);
    }

    #[test]
    fn test_release_unknown_reservation() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let id = ledger.reserve(&shared_job(), Some(0)).unwrap();
        ledger.release(id).unwrap();
        assert!(matches!(ledger.release(id), Err(KabukiError::Internal(_))));
    }

    #[test]
    fn test_bad_accelerator_index() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        assert!(ledger.reserve(&shared_job(), Some(5)).is_err());
        assert_eq!(ledger.depth(), 0);
    }

    #[test]
    fn test_accelerator_array_is_never_reallocated() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let before = ledger.accelerators().as_ptr();
        let ids: Vec<_> = (0..16)
            .map(|i| ledger.reserve(&shared_job(), Some(i % 2)).unwrap())
            .collect();
        assert_eq!(ledger.accelerators().as_ptr(), before);
        ledger.release(ids[3]).unwrap();
        assert_eq!(ledger.accelerators().as_ptr(), before);
    }

    #[test]
    fn test_cloned_ledger_releases_independently() {
        let mut ledger = MachineLedger::from_reading(&example_reading());
        let first = ledger.reserve(&shared_job(), Some(0)).unwrap();
        let second = ledger.reserve(&shared_job(), Some(1)).unwrap();

        let mut copy = ledger.clone();
        copy.release(first).unwrap();
        copy.release(second).unwrap();
        assert_eq!(copy.depth(), 0);
        assert_eq!(ledger.depth(), 2);

        ledger.release(second).unwrap();
        assert_eq!(ledger.depth(), 1);
    }
}
