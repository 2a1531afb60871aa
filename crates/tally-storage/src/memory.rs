use crate::error::{Result, StoreError};
use crate::MetricStore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tally_common::types::{Metric, MetricKind, MetricTable, MetricValue};

/// Previous state of one key, replayed in reverse to undo a partial batch.
struct Undo {
    name: String,
    kind: MetricKind,
    previous: Option<MetricValue>,
}

fn merge_one(table: &mut MetricTable, metric: &Metric) -> Result<(Undo, MetricValue)> {
    metric.validate()?;
    let kind = metric.kind();
    if let Some(stored) = table.kind_of(&metric.name) {
        if stored != kind {
            return Err(StoreError::KindMismatch {
                name: metric.name.clone(),
                stored,
                requested: kind,
            });
        }
    }

    let previous = table.get(&metric.name, kind);
    let stored = match metric.value {
        MetricValue::Gauge(v) => {
            table.gauge.insert(metric.name.clone(), v);
            MetricValue::Gauge(v)
        }
        MetricValue::Counter(delta) => {
            let current = table.counter.get(&metric.name).copied().unwrap_or(0);
            let next = current
                .checked_add(delta)
                .ok_or_else(|| StoreError::Overflow(metric.name.clone()))?;
            table.counter.insert(metric.name.clone(), next);
            MetricValue::Counter(next)
        }
    };

    let undo = Undo {
        name: metric.name.clone(),
        kind,
        previous,
    };
    Ok((undo, stored))
}

fn rollback(table: &mut MetricTable, undo: Vec<Undo>) {
    for entry in undo.into_iter().rev() {
        match (entry.kind, entry.previous) {
            (MetricKind::Gauge, Some(MetricValue::Gauge(v))) => {
                table.gauge.insert(entry.name, v);
            }
            (MetricKind::Counter, Some(MetricValue::Counter(d))) => {
                table.counter.insert(entry.name, d);
            }
            (MetricKind::Gauge, _) => {
                table.gauge.remove(&entry.name);
            }
            (MetricKind::Counter, _) => {
                table.counter.remove(&entry.name);
            }
        }
    }
}

/// Applies every metric or, on the first failure, restores the table and
/// returns the error.
fn merge_all(table: &mut MetricTable, metrics: &[Metric]) -> Result<(Vec<Undo>, Vec<MetricValue>)> {
    let mut undo = Vec::with_capacity(metrics.len());
    let mut stored = Vec::with_capacity(metrics.len());
    for metric in metrics {
        match merge_one(table, metric) {
            Ok((entry, value)) => {
                undo.push(entry);
                stored.push(value);
            }
            Err(e) => {
                rollback(table, undo);
                return Err(e);
            }
        }
    }
    Ok((undo, stored))
}

/// Replaces `path` via a sibling temp file and rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// In-process metric table with optional JSON snapshot persistence.
///
/// Lock order is always `persist` then `table`. In write-through mode every
/// update holds both for the whole merge-and-write, and a failed write rolls
/// the merge back so memory never runs ahead of an error the caller saw.
pub struct MemoryStore {
    table: RwLock<MetricTable>,
    file: Option<PathBuf>,
    write_through: bool,
    persist: Mutex<()>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// `write_through` only takes effect when a snapshot file is set.
    pub fn new(file: Option<PathBuf>, write_through: bool) -> Self {
        let write_through = write_through && file.is_some();
        Self {
            table: RwLock::new(MetricTable::default()),
            file,
            write_through,
            persist: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// A store with no persistence at all.
    pub fn ephemeral() -> Self {
        Self::new(None, false)
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_write_through(&self) -> bool {
        self.write_through
    }

    fn read_table(&self) -> RwLockReadGuard<'_, MetricTable> {
        self.table.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, MetricTable> {
        self.table.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.persist.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn commit(&self, metrics: &[Metric]) -> Result<Vec<MetricValue>> {
        self.ensure_open()?;
        let _persist = self.write_through.then(|| self.lock_persist());
        let mut table = self.write_table();
        // close() may have won the race for the table lock.
        self.ensure_open()?;
        let (undo, stored) = merge_all(&mut table, metrics)?;

        if let Some(path) = self.file.as_deref().filter(|_| self.write_through) {
            let written = serde_json::to_vec_pretty(&*table)
                .map_err(StoreError::from)
                .and_then(|bytes| write_atomic(path, &bytes));
            if let Err(e) = written {
                rollback(&mut table, undo);
                tracing::error!(path = %path.display(), error = %e, "Write-through failed, update rolled back");
                return Err(e);
            }
        }
        Ok(stored)
    }
}

impl MetricStore for MemoryStore {
    fn update(&self, metric: &Metric) -> Result<MetricValue> {
        let stored = self.commit(std::slice::from_ref(metric))?;
        stored
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound {
                name: metric.name.clone(),
                kind: metric.kind(),
            })
    }

    fn update_batch(&self, metrics: &[Metric]) -> Result<()> {
        self.commit(metrics).map(|_| ())
    }

    fn read(&self, name: &str, kind: MetricKind) -> Result<MetricValue> {
        self.ensure_open()?;
        self.read_table()
            .get(name, kind)
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
                kind,
            })
    }

    fn read_all(&self) -> Result<MetricTable> {
        self.ensure_open()?;
        Ok(self.read_table().clone())
    }

    fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = self.file.as_deref() else {
            return Ok(());
        };
        let _persist = self.lock_persist();
        let bytes = serde_json::to_vec_pretty(&*self.read_table())?;
        write_atomic(path, &bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(())
    }

    /// Marks the store closed and writes the final snapshot while holding
    /// the table lock, so every acknowledged update is on disk afterwards.
    fn close(&self) -> Result<()> {
        let _persist = self.lock_persist();
        let table = self.write_table();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(path) = self.file.as_deref() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&*table)?;
        write_atomic(path, &bytes)?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Final snapshot written");
        Ok(())
    }

    fn restore_from_durable(&self) -> Result<usize> {
        self.ensure_open()?;
        let Some(path) = self.file.as_deref() else {
            return Ok(0);
        };
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No snapshot file, starting empty");
                return Ok(0);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(0);
        }

        let snapshot: MetricTable = serde_json::from_slice(&bytes)?;
        let metrics = snapshot.metrics();
        merge_all(&mut self.write_table(), &metrics)?;
        tracing::info!(path = %path.display(), count = metrics.len(), "Restored metrics from snapshot");
        Ok(metrics.len())
    }
}
