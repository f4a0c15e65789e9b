//! Resource readings reported by the host probe

use serde::{Deserialize, Serialize};

/// One accelerator as seen by the probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorReading {
    /// Device name
    pub name: String,
    /// Total memory in MiB
    pub total_memory: i64,
    /// Free memory in MiB
    pub free_memory: i64,
    /// Current utilization as a fraction (0.0-1.0)
    pub utilization_fraction: f64,
}

/// Capacity snapshot of one host at probe time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReading {
    /// Fraction of total CPU in use
    pub cpu_usage_fraction: f64,
    /// Available memory in KB
    pub free_memory_kb: i64,
    /// Number of logical CPUs
    pub cpu_count: u32,
    /// Detected accelerators, in device order
    pub accelerators: Vec<AcceleratorReading>,
}

impl ResourceReading {
    /// Available memory in MiB, the unit job requirements use.
    pub fn free_memory_mib(&self) -> i64 {
        self.free_memory_kb / 1024
    }

    /// The same host with no load on it: idle CPU and idle, empty accelerators.
    ///
    /// Host memory stays as read since the probe does not report a total.
    pub fn at_zero_load(&self) -> Self {
        Self {
            cpu_usage_fraction: 0.0,
            free_memory_kb: self.free_memory_kb,
            cpu_count: self.cpu_count,
            accelerators: self
                .accelerators
                .iter()
                .map(|a| AcceleratorReading {
                    name: a.name.clone(),
                    total_memory: a.total_memory,
                    free_memory: a.total_memory,
                    utilization_fraction: 0.0,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> ResourceReading {
        ResourceReading {
            cpu_usage_fraction: 0.4,
            free_memory_kb: 8 * 1024 * 1024,
            cpu_count: 16,
            accelerators: vec![AcceleratorReading {
                name: "GeForce GTX 1080 Ti".to_string(),
                total_memory: 11178,
                free_memory: 3551,
                utilization_fraction: 0.28,
            }],
        }
    }

    #[test]
    fn test_free_memory_mib() {
        assert_eq!(reading().free_memory_mib(), 8192);
    }

    #[test]
    fn test_zero_load() {
        let idle = reading().at_zero_load();
        assert_eq!(idle.cpu_usage_fraction, 0.0);
        assert_eq!(idle.accelerators[0].free_memory, 11178);
        assert_eq!(idle.accelerators[0].utilization_fraction, 0.0);
        assert_eq!(idle.free_memory_kb, reading().free_memory_kb);
    }

    #[test]
    fn test_reading_json_shape() {
        let json = serde_json::to_value(reading()).unwrap();
        assert_eq!(json["cpu_count"], 16);
        assert_eq!(json["accelerators"][0]["free_memory"], 3551);
    }
}
