use crate::Collector;
use anyhow::{anyhow, Result};
use rand::Rng;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tally_common::types::Metric;

/// Samples the agent's own process: memory, disk I/O, CPU and uptime, plus
/// a `RandomValue` gauge.
pub struct RuntimeCollector {
    system: System,
    pid: Pid,
}

impl RuntimeCollector {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("current pid: {e}"))?;
        let mut collector = Self {
            system: System::new(),
            pid,
        };
        // CPU usage is a diff between refreshes; prime the first one.
        collector.refresh_process();
        Ok(collector)
    }

    fn refresh_process(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new()
                .with_memory()
                .with_cpu()
                .with_disk_usage(),
        );
    }
}

impl Collector for RuntimeCollector {
    fn name(&self) -> &str {
        "runtime"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        self.refresh_process();
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not found", self.pid))?;
        let disk = process.disk_usage();

        Ok(vec![
            Metric::gauge("Alloc", process.memory() as f64),
            Metric::gauge("Sys", process.virtual_memory() as f64),
            Metric::gauge("DiskWritten", disk.total_written_bytes as f64),
            Metric::gauge("DiskRead", disk.total_read_bytes as f64),
            Metric::gauge("ProcessCPU", f64::from(process.cpu_usage())),
            Metric::gauge("RunTime", process.run_time() as f64),
            Metric::gauge("RandomValue", rand::thread_rng().gen::<f64>()),
        ])
    }
}
