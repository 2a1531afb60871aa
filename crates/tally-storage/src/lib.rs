//! Authoritative metric table for the tally server.
//!
//! Two backends implement [`MetricStore`]: [`memory::MemoryStore`] keeps the
//! table in process and snapshots it to a JSON file, [`sqlite::SqliteStore`]
//! keeps it in a SQLite database. [`Storage::open`] picks one from
//! [`StoreConfig`] at startup.
//!
//! Both apply the same merge rule: gauges are replaced, counters accumulate
//! the reported delta, and a name never holds two kinds at once.

pub mod error;
pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod tests;

use error::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tally_common::types::{Metric, MetricKind, MetricTable, MetricValue};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Backend-agnostic metric store.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because the HTTP and gRPC handlers call into the same store
/// concurrently. Every method is one critical section: a batch is applied
/// entirely or not at all.
pub trait MetricStore: Send + Sync {
    /// Merges one metric and returns the stored value afterwards.
    fn update(&self, metric: &Metric) -> Result<MetricValue>;

    /// Merges every metric, or none of them if any one fails.
    fn update_batch(&self, metrics: &[Metric]) -> Result<()>;

    /// Current value of `name` under `kind`. Never creates the key.
    fn read(&self, name: &str, kind: MetricKind) -> Result<MetricValue>;

    /// Copy of the whole table.
    fn read_all(&self) -> Result<MetricTable>;

    /// Liveness of the backing storage.
    fn ping(&self) -> Result<()>;

    /// Writes pending state to durable storage.
    fn flush(&self) -> Result<()>;

    /// Flushes and releases the backend. Later calls fail with
    /// [`StoreError::Closed`](error::StoreError::Closed).
    fn close(&self) -> Result<()>;

    /// Loads persisted state at startup. Returns the number of entries.
    fn restore_from_durable(&self) -> Result<usize>;
}

/// `[store]` section of the server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Seconds between snapshot writes; `0` writes through on every update.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Snapshot file. Empty disables file persistence.
    #[serde(default = "default_file")]
    pub file: String,
    /// Load the snapshot file (or count DB rows) at startup.
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// SQLite path or `:memory:`. When set, the durable backend is used and
    /// the snapshot file settings are ignored.
    #[serde(default)]
    pub database_dsn: Option<String>,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_file() -> String {
    "/tmp/tally-metrics-db.json".to_string()
}

fn default_restore() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            file: default_file(),
            restore: default_restore(),
            database_dsn: None,
        }
    }
}

impl StoreConfig {
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        (!self.file.is_empty()).then(|| PathBuf::from(&self.file))
    }
}

/// The configured backend.
pub enum Storage {
    Memory(MemoryStore),
    Durable(SqliteStore),
}

impl Storage {
    /// Opens the backend selected by `config`: SQLite when a DSN is set,
    /// otherwise the in-memory table.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        match config.database_dsn.as_deref().filter(|d| !d.is_empty()) {
            Some(dsn) => {
                tracing::info!(dsn = %dsn, "Using SQLite metric store");
                Ok(Storage::Durable(SqliteStore::open(dsn)?))
            }
            None => {
                let path = config.snapshot_path();
                tracing::info!(
                    file = ?path,
                    interval_secs = config.interval_secs,
                    "Using in-memory metric store"
                );
                Ok(Storage::Memory(MemoryStore::new(
                    path,
                    config.interval_secs == 0,
                )))
            }
        }
    }

    /// Period of the background snapshot task, if this backend needs one.
    pub fn flush_interval(&self, config: &StoreConfig) -> Option<Duration> {
        match self {
            Storage::Memory(store) if store.has_file() && config.interval_secs > 0 => {
                Some(Duration::from_secs(config.interval_secs))
            }
            _ => None,
        }
    }

    fn inner(&self) -> &dyn MetricStore {
        match self {
            Storage::Memory(store) => store,
            Storage::Durable(store) => store,
        }
    }
}

impl MetricStore for Storage {
    fn update(&self, metric: &Metric) -> Result<MetricValue> {
        self.inner().update(metric)
    }

    fn update_batch(&self, metrics: &[Metric]) -> Result<()> {
        self.inner().update_batch(metrics)
    }

    fn read(&self, name: &str, kind: MetricKind) -> Result<MetricValue> {
        self.inner().read(name, kind)
    }

    fn read_all(&self) -> Result<MetricTable> {
        self.inner().read_all()
    }

    fn ping(&self) -> Result<()> {
        self.inner().ping()
    }

    fn flush(&self) -> Result<()> {
        self.inner().flush()
    }

    fn close(&self) -> Result<()> {
        self.inner().close()
    }

    fn restore_from_durable(&self) -> Result<usize> {
        self.inner().restore_from_durable()
    }
}
