//! kabuki-scheduler: Resource-aware batch scheduling
//!
//! This crate decides where jobs run and drives them there:
//! - A reversible cost model over per-machine capacity snapshots
//! - Greedy machine and accelerator selection, capacity probing
//! - The batch loop: dispatch, completion polling, cancellation

pub mod cost;
pub mod ledger;
pub mod placement;
pub mod scheduler;

pub use cost::{Cost, CostModel, SENTINEL};
pub use ledger::{GpuState, HostState, MachineLedger, MachineView, ReservationId};
pub use placement::{
    ensure_feasible, place_on_fleet, place_tentatively, probe_capacity, rank_machines,
    select_best_accelerator, select_best_machine, zero_load_capacity, PlacementDecision,
};
pub use scheduler::{BatchOptions, BatchReport, DryRunPlan, Machine, PlannedJob, Scheduler};
