use crate::Collector;
use anyhow::{bail, Result};
use sysinfo::System;
use tally_common::types::Metric;

/// Host-wide memory and per-core CPU utilization.
///
/// Produces `TotalMemory`, `FreeMemory` and `CPUutilization1..N`.
pub struct HostCollector {
    system: System,
}

impl HostCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for HostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for HostCollector {
    fn name(&self) -> &str {
        "host"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        if total == 0 {
            bail!("host memory statistics unavailable");
        }

        let mut points = vec![
            Metric::gauge("TotalMemory", total as f64),
            Metric::gauge("FreeMemory", self.system.free_memory() as f64),
        ];
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            points.push(Metric::gauge(
                format!("CPUutilization{}", i + 1),
                f64::from(cpu.cpu_usage()),
            ));
        }
        Ok(points)
    }
}
