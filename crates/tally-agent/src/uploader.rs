use crate::config::AgentConfig;
use crate::transport::{Transport, TransportError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_collector::snapshot::MetricSnapshot;
use tally_common::id::next_batch_id;
use tally_common::sign::Signer;
use tally_common::types::{Metric, MetricRecord, MetricTable, MetricValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("upload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Counter totals the collector has acknowledged, keyed by name.
type Acked = BTreeMap<String, i64>;

/// What one upload would send: gauges as-is, counters as the delta against
/// the acknowledged total. `totals` holds the snapshot totals to record once
/// the collector accepts.
struct Pending {
    metrics: Vec<Metric>,
    totals: Vec<(String, i64)>,
}

fn pending(view: &MetricTable, acked: &Acked) -> Pending {
    let mut metrics: Vec<Metric> = view
        .gauge
        .iter()
        .map(|(name, v)| Metric::gauge(name.clone(), *v))
        .collect();
    let mut totals = Vec::new();
    for (name, total) in &view.counter {
        let delta = match acked.get(name) {
            Some(done) if done == total => continue,
            Some(done) => total.saturating_sub(*done),
            None => *total,
        };
        metrics.push(Metric::counter(name.clone(), delta));
        totals.push((name.clone(), *total));
    }
    Pending { metrics, totals }
}

/// Serializes the snapshot into signed records and hands them to the
/// transport.
///
/// Uploads are serialized on the acknowledged-totals lock, so two uploads
/// never compute a counter delta from the same baseline.
pub struct Uploader {
    transport: Arc<Transport>,
    signer: Option<Signer>,
    acked: Mutex<Acked>,
}

impl Uploader {
    pub fn new(transport: Transport, signer: Option<Signer>) -> Self {
        Self {
            transport: Arc::new(transport),
            signer,
            acked: Mutex::new(Acked::new()),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, TransportError> {
        let transport = Transport::from_config(config)?;
        let signer = Signer::from_key(config.sign_key.as_deref());
        if signer.is_none() {
            tracing::info!("No signing key configured, records are sent unsigned");
        }
        Ok(Self::new(transport, signer))
    }

    fn record(&self, metric: &Metric) -> MetricRecord {
        MetricRecord::from_metric(metric).with_hash(self.signer.as_ref().map(|s| s.sign(metric)))
    }

    /// Sends the whole snapshot as one batch. Returns the number of records
    /// delivered; an empty snapshot sends nothing.
    pub async fn upload_batch(&self, snapshot: &MetricSnapshot) -> Result<usize, UploadError> {
        let mut acked = self.acked.lock().await;
        let Pending { metrics, totals } = pending(&snapshot.view(), &acked);
        if metrics.is_empty() {
            return Ok(0);
        }

        let records: Vec<MetricRecord> = metrics.iter().map(|m| self.record(m)).collect();
        let batch_id = next_batch_id();
        self.transport.send_batch(&batch_id, &records).await?;

        acked.extend(totals);
        tracing::debug!(batch_id = %batch_id, count = records.len(), "Batch uploaded");
        Ok(records.len())
    }

    /// One request per metric, in order. Stops at the first failure; counters
    /// sent before it keep their advanced baseline.
    #[deprecated(note = "use `upload_batch`")]
    pub async fn upload_each(&self, snapshot: &MetricSnapshot) -> Result<usize, UploadError> {
        let mut acked = self.acked.lock().await;
        let Pending { metrics, totals } = pending(&snapshot.view(), &acked);
        let totals: BTreeMap<String, i64> = totals.into_iter().collect();

        let mut sent = 0;
        for metric in &metrics {
            self.transport.send_record(&self.record(metric)).await?;
            if let Some(total) = totals.get(&metric.name) {
                acked.insert(metric.name.clone(), *total);
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// One request per metric, all in flight at once. Waits for every
    /// request, then returns the first error if any failed.
    #[deprecated(note = "use `upload_batch`")]
    pub async fn upload_concurrent(&self, snapshot: &MetricSnapshot) -> Result<usize, UploadError> {
        let mut acked = self.acked.lock().await;
        let Pending { metrics, totals } = pending(&snapshot.view(), &acked);
        let totals: BTreeMap<String, i64> = totals.into_iter().collect();

        let mut tasks = JoinSet::new();
        for metric in metrics {
            let record = self.record(&metric);
            let transport = Arc::clone(&self.transport);
            tasks.spawn(async move {
                let result = transport.send_record(&record).await;
                (metric, result)
            });
        }

        let mut sent = 0;
        let mut first_error: Option<UploadError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((metric, Ok(()))) => {
                    if let (MetricValue::Counter(_), Some(total)) =
                        (metric.value, totals.get(&metric.name))
                    {
                        acked.insert(metric.name, *total);
                    }
                    sent += 1;
                }
                Ok((metric, Err(e))) => {
                    tracing::warn!(metric = %metric.name, error = %e, "Single-metric upload failed");
                    first_error.get_or_insert(e.into());
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }
}
