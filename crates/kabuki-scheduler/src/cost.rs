//! Placement cost model
//!
//! Every resource dimension contributes a hard penalty of [`SENTINEL`] per
//! violated invariant (an exclusivity conflict or oversubscribed memory) plus
//! a cubic soft term `SENTINEL * (usage / soft_limit)^3`. A total at or above
//! the sentinel marks a placement that does not fit.

use kabuki_core::{JobRequirement, SchedulerConfig};
use std::cmp::Ordering;

use crate::ledger::{GpuState, HostState, MachineView};

/// Cost at or above which a placement is infeasible
pub const SENTINEL: f64 = 1e10;

/// Scalar placement score; lower is better
#[derive(Debug, Clone, Copy)]
pub enum Cost {
    Feasible(f64),
    Infeasible(f64),
}

impl Cost {
    /// Tag a raw score against the sentinel.
    pub fn from_raw(raw: f64) -> Self {
        if raw >= SENTINEL || raw.is_nan() {
            Cost::Infeasible(raw)
        } else {
            Cost::Feasible(raw)
        }
    }

    /// The numeric score, `>= SENTINEL` exactly when infeasible
    pub fn raw(&self) -> f64 {
        match *self {
            Cost::Feasible(raw) | Cost::Infeasible(raw) => raw,
        }
    }

    pub fn is_over_limit(&self) -> bool {
        matches!(self, Cost::Infeasible(_))
    }
}

impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw().total_cmp(&other.raw())
    }
}

fn penalty(violated: bool) -> f64 {
    if violated {
        SENTINEL
    } else {
        0.0
    }
}

fn soft(usage: f64, limit: f64) -> f64 {
    SENTINEL * (usage / limit).powi(3)
}

/// Soft limits the cubic terms normalise by
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub cpu_soft_limit: f64,
    pub accelerator_soft_limit: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            cpu_soft_limit: 1.5,
            accelerator_soft_limit: 1.2,
        }
    }
}

impl From<&SchedulerConfig> for CostModel {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            cpu_soft_limit: config.cpu_soft_limit,
            accelerator_soft_limit: config.accelerator_soft_limit,
        }
    }
}

impl CostModel {
    fn host_raw(&self, host: &HostState) -> f64 {
        penalty(host.reserved_count > 1)
            + penalty(host.free_memory < 0)
            + soft(host.cpu_usage_fraction, self.cpu_soft_limit)
    }

    fn accelerator_raw(&self, gpu: &GpuState) -> f64 {
        penalty(gpu.free_memory < 0)
            + penalty(gpu.reserved_count > 1)
            + soft(gpu.utilization_fraction, self.accelerator_soft_limit)
    }

    pub fn host_cost(&self, host: &HostState) -> Cost {
        Cost::from_raw(self.host_raw(host))
    }

    pub fn accelerator_cost(&self, gpu: &GpuState) -> Cost {
        Cost::from_raw(self.accelerator_raw(gpu))
    }

    /// Host cost plus the cheapest accelerator when the job wants one.
    ///
    /// Used to rank machines against each other.
    pub fn machine_cost(&self, view: MachineView<'_>, requirement: &JobRequirement) -> Cost {
        let host = self.host_raw(view.host);
        if !requirement.wants_accelerator {
            return Cost::from_raw(host);
        }
        let cheapest = view
            .accelerators
            .iter()
            .map(|g| self.accelerator_raw(g))
            .min_by(f64::total_cmp);
        match cheapest {
            Some(acc) => Cost::from_raw(host + acc),
            None => Cost::Infeasible(host + SENTINEL),
        }
    }

    /// Host cost plus the cost of the accelerator a reservation landed on.
    ///
    /// Used to decide whether a tentative reservation fits.
    pub fn placement_cost(
        &self,
        view: MachineView<'_>,
        requirement: &JobRequirement,
        accelerator: Option<usize>,
    ) -> Cost {
        let host = self.host_raw(view.host);
        if !requirement.wants_accelerator {
            return Cost::from_raw(host);
        }
        match accelerator.and_then(|idx| view.accelerators.get(idx)) {
            Some(gpu) => Cost::from_raw(host + self.accelerator_raw(gpu)),
            None => Cost::Infeasible(host + SENTINEL),
        }
    }
}
