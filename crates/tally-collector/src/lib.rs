//! Sample sources for the tally agent.
//!
//! Each [`Collector`] reads one category of telemetry (process runtime
//! stats, host memory and CPU) and returns it as a list of [`Metric`]s.
//! [`snapshot::MetricSnapshot`] folds those samples into the agent's latest
//! view, which the uploader reads.

pub mod host;
pub mod runtime;
pub mod snapshot;

use anyhow::Result;
use tally_common::types::Metric;

/// A telemetry source that runs on the agent host.
///
/// Sampling may block on OS calls, so the agent drives collectors from
/// blocking tasks. The trait requires `Send + Sync` so a collector can be
/// moved into such a task.
pub trait Collector: Send + Sync {
    /// Returns the collector name (e.g., `"runtime"`, `"host"`), used for
    /// logging.
    fn name(&self) -> &str;

    /// Samples current values. Gauges in the result overwrite, counters
    /// are added to the snapshot's running totals.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails.
    fn collect(&mut self) -> Result<Vec<Metric>>;
}
