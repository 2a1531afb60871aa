use crate::Collector;
use anyhow::Result;
use std::sync::RwLock;
use tally_common::types::{Metric, MetricTable, MetricValue};

/// Counter incremented by exactly one on every successful primary refresh.
pub const POLL_COUNT: &str = "PollCount";

/// The agent's latest sample values.
///
/// Writers sample outside the lock and then apply the whole sample under a
/// single write lock, so a reader sees either all of a refresh or none of
/// it. Counters hold running totals since agent start.
#[derive(Debug, Default)]
pub struct MetricSnapshot {
    table: RwLock<MetricTable>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the primary source and applies its sample, bumping
    /// [`POLL_COUNT`]. A failed sample changes nothing.
    pub fn refresh(&self, source: &mut dyn Collector) -> Result<()> {
        let sample = source.collect()?;
        self.apply(sample, true);
        Ok(())
    }

    /// Runs an optional source and applies its sample. Failure is returned
    /// to the caller and never undoes an earlier [`refresh`](Self::refresh).
    pub fn refresh_extra(&self, source: &mut dyn Collector) -> Result<()> {
        let sample = source.collect()?;
        self.apply(sample, false);
        Ok(())
    }

    fn apply(&self, sample: Vec<Metric>, count_poll: bool) {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        for metric in sample {
            match metric.value {
                MetricValue::Gauge(v) => {
                    table.gauge.insert(metric.name, v);
                }
                MetricValue::Counter(d) => {
                    let total = table.counter.entry(metric.name).or_insert(0);
                    *total = total.saturating_add(d);
                }
            }
        }
        if count_poll {
            let polls = table.counter.entry(POLL_COUNT.to_string()).or_insert(0);
            *polls += 1;
        }
    }

    /// A consistent copy of the current values, taken under the read lock.
    pub fn view(&self) -> MetricTable {
        self.table.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn poll_count(&self) -> i64 {
        self.table
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .counter
            .get(POLL_COUNT)
            .copied()
            .unwrap_or(0)
    }
}
