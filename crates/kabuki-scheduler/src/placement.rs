//! Greedy placement decisions

use kabuki_core::{JobRequirement, KabukiError, KabukiResult, ResourceReading};

use crate::cost::{Cost, CostModel};
use crate::ledger::{MachineLedger, MachineView, ReservationId};

/// Upper bound on reservations tried by [`probe_capacity`]; a requirement
/// that consumes nothing would otherwise never reach the limit.
const MAX_PROBED_SLOTS: usize = 4096;

/// A tentative reservation and what it costs
#[derive(Debug, Clone, Copy)]
pub struct PlacementDecision {
    pub reservation: ReservationId,
    pub accelerator: Option<usize>,
    pub cost: Cost,
}

/// Cheapest accelerator on the machine, lowest index on ties.
pub fn select_best_accelerator(model: &CostModel, view: MachineView<'_>) -> Option<usize> {
    view.accelerators
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            model
                .accelerator_cost(a)
                .cmp(&model.accelerator_cost(b))
                .then(ia.cmp(ib))
        })
        .map(|(idx, _)| idx)
}

/// Machine indices from cheapest to most expensive, lowest index on ties.
pub fn rank_machines(
    model: &CostModel,
    ledgers: &[MachineLedger],
    requirement: &JobRequirement,
) -> Vec<usize> {
    let mut ranked: Vec<(usize, Cost)> = ledgers
        .iter()
        .enumerate()
        .map(|(idx, ledger)| (idx, model.machine_cost(ledger.view(), requirement)))
        .collect();
    ranked.sort_by(|(ia, a), (ib, b)| a.cmp(b).then(ia.cmp(ib)));
    ranked.into_iter().map(|(idx, _)| idx).collect()
}

/// Cheapest machine of the fleet for `requirement`, lowest index on ties.
pub fn select_best_machine(
    model: &CostModel,
    ledgers: &[MachineLedger],
    requirement: &JobRequirement,
) -> Option<usize> {
    rank_machines(model, ledgers, requirement).first().copied()
}

/// Reserve one instance of `requirement` on the best accelerator of `ledger`
/// and price the result. The caller keeps or releases the reservation.
pub fn place_tentatively(
    model: &CostModel,
    ledger: &mut MachineLedger,
    requirement: &JobRequirement,
) -> KabukiResult<PlacementDecision> {
    let accelerator = if requirement.wants_accelerator {
        select_best_accelerator(model, ledger.view())
    } else {
        None
    };
    let reservation = ledger.reserve(requirement, accelerator)?;
    let cost = model.placement_cost(ledger.view(), requirement, accelerator);
    Ok(PlacementDecision {
        reservation,
        accelerator,
        cost,
    })
}

/// Hold one instance of `requirement` on the cheapest machine it fits on.
///
/// Machines are tried in [`rank_machines`] order. A reservation that goes
/// over the limit is released before the next machine is tried. `None` means
/// every machine is over the limit and no reservation is held.
pub fn place_on_fleet(
    model: &CostModel,
    ledgers: &mut [MachineLedger],
    requirement: &JobRequirement,
) -> KabukiResult<Option<(usize, PlacementDecision)>> {
    for machine in rank_machines(model, ledgers, requirement) {
        let decision = place_tentatively(model, &mut ledgers[machine], requirement)?;
        if !decision.cost.is_over_limit() {
            return Ok(Some((machine, decision)));
        }
        ledgers[machine].release(decision.reservation)?;
    }
    Ok(None)
}

/// How many instances of `requirement` fit on the machine right now.
///
/// Returns the accelerator each successive instance would take. The ledger
/// is left exactly as it was found.
pub fn probe_capacity(
    model: &CostModel,
    ledger: &mut MachineLedger,
    requirement: &JobRequirement,
) -> KabukiResult<Vec<Option<usize>>> {
    let mut slots = Vec::new();
    let mut held = Vec::new();
    let result = loop {
        if slots.len() >= MAX_PROBED_SLOTS {
            break Ok(());
        }
        match place_tentatively(model, ledger, requirement) {
            Ok(decision) => {
                held.push(decision.reservation);
                if decision.cost.is_over_limit() {
                    break Ok(());
                }
                slots.push(decision.accelerator);
            }
            Err(e) => break Err(e),
        }
    };
    for reservation in held.into_iter().rev() {
        ledger.release(reservation)?;
    }
    result.map(|()| slots)
}

/// Slots the machine would offer with nothing else running on it.
pub fn zero_load_capacity(
    model: &CostModel,
    reading: &ResourceReading,
    requirement: &JobRequirement,
) -> KabukiResult<usize> {
    let mut ledger = MachineLedger::from_reading(&reading.at_zero_load());
    Ok(probe_capacity(model, &mut ledger, requirement)?.len())
}

/// Fail with `ResourceInfeasible` when no machine can host even one
/// instance of `requirement`.
pub fn ensure_feasible(
    model: &CostModel,
    readings: &[(String, &ResourceReading)],
    requirement: &JobRequirement,
) -> KabukiResult<()> {
    for (_, reading) in readings {
        let mut ledger = MachineLedger::from_reading(&reading.at_zero_load());
        let decision = place_tentatively(model, &mut ledger, requirement)?;
        if !decision.cost.is_over_limit() {
            return Ok(());
        }
    }
    let names: Vec<&str> = readings.iter().map(|(name, _)| name.as_str()).collect();
    Err(KabukiError::ResourceInfeasible(format!(
        "job needs {} cpus, {} MiB memory{} and fits on none of [{}] even when idle",
        requirement.cpu_share,
        requirement.memory_mib,
        if requirement.wants_accelerator {
            format!(", {} MiB accelerator memory", requirement.accelerator_memory)
        } else {
            String::new()
        },
        names.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kabuki_core::AcceleratorReading;
    use proptest::prelude::*;

    fn reading(accelerators: &[(i64, f64)]) -> ResourceReading {
        ResourceReading {
            cpu_usage_fraction: 0.124,
            free_memory_kb: 30607 * 1024,
            cpu_count: 24,
            accelerators: accelerators
                .iter()
                .map(|&(free, util)| AcceleratorReading {
                    name: "GeForce RTX 2060".to_string(),
                    total_memory: free + 1,
                    free_memory: free,
                    utilization_fraction: util,
                })
                .collect(),
        }
    }

    fn example() -> ResourceReading {
        reading(&[(5933, 0.0), (5931, 0.0)])
    }

    fn shared_job() -> JobRequirement {
        JobRequirement {
            cpu_share: 2.0,
            memory_mib: 2000,
            wants_accelerator: true,
            accelerator_memory: 1000,
            accelerator_utilization: 0.3,
            exclusive_host: false,
            exclusive_accelerator: false,
        }
    }

    #[test]
    fn test_capacity_of_example_machine() {
        let model = CostModel::default();
        let mut ledger = MachineLedger::from_reading(&example());
        let slots = probe_capacity(&model, &mut ledger, &shared_job()).unwrap();
        assert_eq!(slots.len(), 6);
        assert_eq!(
            slots,
            vec![Some(0), Some(1), Some(0), Some(1), Some(0), Some(1)]
        );
        assert_eq!(ledger.depth(), 0);
        assert_eq!(
            probe_capacity(&model, &mut ledger, &shared_job()).unwrap(),
            slots
        );
    }

    #[test]
    fn test_idle_tie_prefers_first_accelerator() {
        let model = CostModel::default();
        let ledger = MachineLedger::from_reading(&reading(&[(5000, 0.0), (5000, 0.0)]));
        assert_eq!(select_best_accelerator(&model, ledger.view()), Some(0));

        let busy_first = MachineLedger::from_reading(&reading(&[(5000, 0.5), (5000, 0.0)]));
        assert_eq!(select_best_accelerator(&model, busy_first.view()), Some(1));

        let none = MachineLedger::from_reading(&reading(&[]));
        assert_eq!(select_best_accelerator(&model, none.view()), None);
    }

    #[test]
    fn test_select_best_machine() {
        let model = CostModel::default();
        let job = shared_job();
        let idle = MachineLedger::from_reading(&example());
        let mut loaded = example();
        loaded.cpu_usage_fraction = 0.9;
        let loaded = MachineLedger::from_reading(&loaded);

        let fleet = vec![loaded, idle.clone(), idle];
        assert_eq!(select_best_machine(&model, &fleet, &job), Some(1));
        assert_eq!(select_best_machine(&model, &[], &job), None);
    }

    #[test]
    fn test_fleet_placement_skips_machine_that_goes_over_limit() {
        let model = CostModel::default();
        let job = JobRequirement {
            accelerator_memory: 1000,
            accelerator_utilization: 0.3,
            ..shared_job()
        };
        // Idle-looking accelerator without the memory, then a busier one with room.
        let mut ledgers = vec![
            MachineLedger::from_reading(&reading(&[(500, 0.0)])),
            MachineLedger::from_reading(&reading(&[(8000, 0.5)])),
        ];
        assert_eq!(select_best_machine(&model, &ledgers, &job), Some(0));
        assert_eq!(rank_machines(&model, &ledgers, &job), vec![0, 1]);

        let (machine, first) = place_on_fleet(&model, &mut ledgers, &job).unwrap().unwrap();
        assert_eq!(machine, 1);
        assert_eq!(first.accelerator, Some(0));
        assert!(!first.cost.is_over_limit());
        assert_eq!(ledgers[0].depth(), 0);
        assert_eq!(ledgers[1].depth(), 1);

        let (machine, _) = place_on_fleet(&model, &mut ledgers, &job).unwrap().unwrap();
        assert_eq!(machine, 1);

        // 0.5 + 3 * 0.3 crosses the accelerator soft limit.
        assert!(place_on_fleet(&model, &mut ledgers, &job).unwrap().is_none());
        assert_eq!(ledgers[0].depth(), 0);
        assert_eq!(ledgers[1].depth(), 2);

        ledgers[1].release(first.reservation).unwrap();
        let (machine, _) = place_on_fleet(&model, &mut ledgers, &job).unwrap().unwrap();
        assert_eq!(machine, 1);
    }

    #[test]
    fn test_exclusive_accelerator_capacity() {
        let model = CostModel::default();
        let job = JobRequirement {
            exclusive_accelerator: true,
            ..shared_job()
        };
        let mut ledger = MachineLedger::from_reading(&example());
        let slots = probe_capacity(&model, &mut ledger, &job).unwrap();
        assert_eq!(slots, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_cpu_only_capacity() {
        let model = CostModel::default();
        let job = JobRequirement {
            wants_accelerator: false,
            cpu_share: 4.0,
            memory_mib: 100,
            ..shared_job()
        };
        let mut ledger = MachineLedger::from_reading(&reading(&[]));
        let slots = probe_capacity(&model, &mut ledger, &job).unwrap();
        assert!(!slots.is_empty());
        assert!(slots.iter().all(Option::is_none));
    }

    #[test]
    fn test_zero_load_feasibility() {
        let model = CostModel::default();
        let mut busy = example();
        busy.cpu_usage_fraction = 3.0;
        busy.accelerators[0].utilization_fraction = 1.0;
        assert!(zero_load_capacity(&model, &busy, &shared_job()).unwrap() > 0);

        let huge = JobRequirement {
            accelerator_memory: 100_000,
            ..shared_job()
        };
        let err = ensure_feasible(&model, &[("box".to_string(), &busy)], &huge).unwrap_err();
        assert!(matches!(err, KabukiError::ResourceInfeasible(_)));
        assert!(err.to_string().contains("box"));

        let cpu_box = reading(&[]);
        let err = ensure_feasible(&model, &[("cpu-box".to_string(), &cpu_box)], &shared_job());
        assert!(err.is_err());
        ensure_feasible(&model, &[("box".to_string(), &busy)], &shared_job()).unwrap();
    }

    fn requirement_strategy() -> impl Strategy<Value = (JobRequirement, usize)> {
        (
            0.0f64..4.0,
            0i64..4000,
            0i64..3000,
            0.0f64..0.6,
            any::<bool>(),
            any::<bool>(),
            0usize..2,
        )
            .prop_map(|(cpu, mem, acc_mem, util, ex_host, ex_acc, acc)| {
                (
                    JobRequirement {
                        cpu_share: cpu,
                        memory_mib: mem,
                        wants_accelerator: true,
                        accelerator_memory: acc_mem,
                        accelerator_utilization: util,
                        exclusive_host: ex_host,
                        exclusive_accelerator: ex_acc,
                    },
                    acc,
                )
            })
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
    }

    proptest! {
        #[test]
        fn prop_reservations_commute(
            ops in proptest::collection::vec(requirement_strategy(), 1..8)
        ) {
            let model = CostModel::default();
            let job = shared_job();
            let base = MachineLedger::from_reading(&example());

            let mut forward = base.clone();
            let ids: Vec<_> = ops
                .iter()
                .map(|(req, acc)| forward.reserve(req, Some(*acc)).unwrap())
                .collect();

            let mut backward = base.clone();
            for (req, acc) in ops.iter().rev() {
                backward.reserve(req, Some(*acc)).unwrap();
            }

            prop_assert!(close(
                model.machine_cost(forward.view(), &job).raw(),
                model.machine_cost(backward.view(), &job).raw()
            ));
            prop_assert_eq!(forward.host().reserved_count, backward.host().reserved_count);
            prop_assert_eq!(forward.host().free_memory, backward.host().free_memory);

            for id in ids.into_iter().rev() {
                forward.release(id).unwrap();
            }
            prop_assert_eq!(forward.host(), base.host());
            prop_assert_eq!(forward.accelerators(), base.accelerators());
        }

        #[test]
        fn prop_cost_is_monotone(
            ops in proptest::collection::vec(requirement_strategy(), 1..12)
        ) {
            let model = CostModel::default();
            let job = shared_job();
            let mut ledger = MachineLedger::from_reading(&example());
            let mut previous = model.machine_cost(ledger.view(), &job);
            for (req, acc) in &ops {
                ledger.reserve(req, Some(*acc)).unwrap();
                let next = model.machine_cost(ledger.view(), &job);
                prop_assert!(next.raw() >= previous.raw() - 1e-6 * previous.raw().abs());
                prop_assert!(!(previous.is_over_limit() && !next.is_over_limit()));
                previous = next;
            }
        }

        #[test]
        fn prop_out_of_order_release_matches_never_reserved(
            ops in proptest::collection::vec(requirement_strategy(), 2..8),
            victim in 0usize..8
        ) {
            let victim = victim % ops.len();
            let mut ledger = MachineLedger::from_reading(&example());
            let ids: Vec<_> = ops
                .iter()
                .map(|(req, acc)| ledger.reserve(req, Some(*acc)).unwrap())
                .collect();
            ledger.release(ids[victim]).unwrap();

            let mut expected = MachineLedger::from_reading(&example());
            for (i, (req, acc)) in ops.iter().enumerate() {
                if i != victim {
                    expected.reserve(req, Some(*acc)).unwrap();
                }
            }
            prop_assert_eq!(ledger.host().free_memory, expected.host().free_memory);
            prop_assert_eq!(ledger.host().reserved_count, expected.host().reserved_count);
            for (a, b) in ledger.accelerators().iter().zip(expected.accelerators()) {
                prop_assert_eq!(a.free_memory, b.free_memory);
                prop_assert_eq!(a.reserved_count, b.reserved_count);
                prop_assert!(close(a.utilization_fraction, b.utilization_fraction));
            }
        }
    }
}
