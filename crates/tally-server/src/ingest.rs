//! Transport-independent update pipeline.
//!
//! Every HTTP handler and the gRPC service go through [`IngestService`], so
//! decode, validation, signature check and the store merge happen the same
//! way whichever transport a report arrives on.

use axum::http::StatusCode;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tally_common::error::{MetricError, SignError};
use tally_common::sign::Signer;
use tally_common::types::{Metric, MetricKind, MetricRecord, MetricTable, MetricValue};
use tally_storage::error::StoreError;
use tally_storage::{MetricStore, Storage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed body, failed parse or a rejected merge. Nothing was applied.
    #[error("{0}")]
    Client(String),

    /// Kind segment of a positional update is neither gauge nor counter.
    #[error("unknown metric kind: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Auth(#[from] SignError),

    #[error("{kind} {name} not found")]
    NotFound { name: String, kind: MetricKind },

    /// Read of a kind the table never holds.
    #[error("no metric kind {kind}, {name} not found")]
    UnknownReadKind { kind: String, name: String },

    #[error("storage failure: {0}")]
    Server(String),
}

impl From<MetricError> for IngestError {
    fn from(err: MetricError) -> Self {
        match err {
            MetricError::UnknownKind(kind) => IngestError::UnknownKind(kind),
            other => IngestError::Client(other.to_string()),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { name, kind } => IngestError::NotFound { name, kind },
            e if e.is_client_error() => IngestError::Client(e.to_string()),
            e => {
                tracing::error!(error = %e, "Store operation failed");
                IngestError::Server(e.to_string())
            }
        }
    }
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::Client(_) | IngestError::Auth(_) => StatusCode::BAD_REQUEST,
            IngestError::UnknownKind(_) => StatusCode::NOT_IMPLEMENTED,
            IngestError::NotFound { .. } | IngestError::UnknownReadKind { .. } => {
                StatusCode::NOT_FOUND
            }
            IngestError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code name for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Client(_) => "bad_request",
            IngestError::UnknownKind(_) => "unknown_kind",
            IngestError::Auth(_) => "invalid_hash",
            IngestError::NotFound { .. } | IngestError::UnknownReadKind { .. } => "not_found",
            IngestError::Server(_) => "storage_error",
        }
    }
}

impl From<IngestError> for tonic::Status {
    fn from(err: IngestError) -> Self {
        let message = err.to_string();
        match err {
            IngestError::Client(_) | IngestError::UnknownKind(_) => {
                tonic::Status::invalid_argument(message)
            }
            IngestError::Auth(_) => tonic::Status::unauthenticated(message),
            IngestError::NotFound { .. } | IngestError::UnknownReadKind { .. } => {
                tonic::Status::not_found(message)
            }
            IngestError::Server(_) => tonic::Status::internal(message),
        }
    }
}

/// Result of a batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    /// The batch id was seen recently; nothing was applied again.
    pub duplicate: bool,
}

/// Bounded FIFO of recently applied batch ids.
struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if self.capacity == 0 || !self.seen.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

pub struct IngestService {
    store: Arc<Storage>,
    signer: Option<Signer>,
    recent_batches: Mutex<DedupWindow>,
}

impl IngestService {
    pub fn new(store: Arc<Storage>, signer: Option<Signer>, dedup_window: usize) -> Self {
        Self {
            store,
            signer,
            recent_batches: Mutex::new(DedupWindow::new(dedup_window)),
        }
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.store
    }

    pub fn signing_enabled(&self) -> bool {
        self.signer.is_some()
    }

    fn authenticate(&self, metric: &Metric, tag: Option<&str>) -> Result<(), IngestError> {
        match &self.signer {
            Some(signer) => signer.verify(metric, tag).map_err(|e| {
                tracing::warn!(metric = %metric.name, error = %e, "Signature check failed");
                IngestError::Auth(e)
            }),
            None => Ok(()),
        }
    }

    /// Record for `metric` with a tag over its value when signing is on.
    pub fn signed_record(&self, metric: &Metric) -> MetricRecord {
        MetricRecord::from_metric(metric).with_hash(self.signer.as_ref().map(|s| s.sign(metric)))
    }

    /// `POST /update/{kind}/{name}/{value}`: strict per-kind parse, then the
    /// same authenticate-and-apply path as structured updates.
    pub fn update_positional(
        &self,
        kind: &str,
        name: &str,
        raw: &str,
        tag: Option<&str>,
    ) -> Result<MetricValue, IngestError> {
        let kind: MetricKind = kind.parse()?;
        let metric = Metric {
            name: name.to_string(),
            value: MetricValue::parse(kind, raw)?,
        };
        metric.validate()?;
        self.authenticate(&metric, tag)?;
        Ok(self.store.update(&metric)?)
    }

    /// One structured record. Returns the stored value after the merge.
    pub fn update_record(&self, record: &MetricRecord) -> Result<MetricValue, IngestError> {
        let metric = record.to_metric()?;
        self.authenticate(&metric, record.tag())?;
        Ok(self.store.update(&metric)?)
    }

    /// Validates and authenticates every record before touching the store,
    /// then applies them as one unit. A batch id already in the window is
    /// acknowledged without applying it again.
    pub fn update_batch(
        &self,
        batch_id: Option<&str>,
        records: &[MetricRecord],
    ) -> Result<BatchOutcome, IngestError> {
        let mut metrics = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let metric = record
                .to_metric()
                .map_err(|e| IngestError::Client(format!("record {index}: {e}")))?;
            self.authenticate(&metric, record.tag())?;
            metrics.push(metric);
        }

        let batch_id = batch_id.filter(|id| !id.is_empty());
        // Held across the apply so a concurrent retry of the same id waits
        // and then sees it as applied.
        let mut recent = self
            .recent_batches
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(id) = batch_id {
            if recent.contains(id) {
                tracing::info!(batch_id = %id, "Duplicate batch acknowledged without applying");
                return Ok(BatchOutcome {
                    applied: 0,
                    duplicate: true,
                });
            }
        }

        self.store.update_batch(&metrics)?;
        if let Some(id) = batch_id {
            recent.insert(id);
        }
        tracing::debug!(batch_id = ?batch_id, count = metrics.len(), "Batch applied");
        Ok(BatchOutcome {
            applied: metrics.len(),
            duplicate: false,
        })
    }

    /// `GET /value/{kind}/{name}`. An unknown kind reads as not found.
    pub fn read(&self, kind: &str, name: &str) -> Result<MetricValue, IngestError> {
        let kind: MetricKind = kind.parse().map_err(|_| IngestError::UnknownReadKind {
            kind: kind.to_string(),
            name: name.to_string(),
        })?;
        Ok(self.store.read(name, kind)?)
    }

    /// `POST /value/`: current value as a record, tagged when signing is on.
    pub fn read_record(&self, query: &MetricRecord) -> Result<MetricRecord, IngestError> {
        if query.id.is_empty() {
            return Err(MetricError::MissingName.into());
        }
        let value = self.store.read(&query.id, query.kind)?;
        Ok(self.signed_record(&Metric {
            name: query.id.clone(),
            value,
        }))
    }

    pub fn read_all(&self) -> Result<MetricTable, IngestError> {
        Ok(self.store.read_all()?)
    }

    pub fn ping(&self) -> Result<(), IngestError> {
        self.store
            .ping()
            .map_err(|e| IngestError::Server(e.to_string()))
    }
}

/// Runs `call` on the blocking pool. Store merges may fsync, run a SQLite
/// transaction or wait on the dedup lock.
pub async fn run_blocking<T, F>(ingest: Arc<IngestService>, call: F) -> Result<T, IngestError>
where
    F: FnOnce(&IngestService) -> Result<T, IngestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&ingest))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Ingest task failed");
            IngestError::Server(format!("ingest task failed: {e}"))
        })?
}
