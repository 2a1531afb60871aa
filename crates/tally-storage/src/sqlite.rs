use crate::error::{Result, StoreError};
use crate::MetricStore;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::sync::{Mutex, MutexGuard};
use tally_common::types::{Metric, MetricKind, MetricTable, MetricValue};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gauges (
    name TEXT PRIMARY KEY,
    value REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Metric table kept in SQLite.
///
/// One connection behind a mutex; every batch is one transaction, so a
/// failed record rolls back the whole batch. Counter accumulation happens in
/// the upsert itself.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `dsn`. `:memory:` gives a private
    /// in-memory database.
    pub fn open(dsn: &str) -> Result<Self> {
        let conn = Connection::open(dsn)?;
        if dsn != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock_conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut guard = self.lock_conn();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn stored_kind(tx: &Transaction<'_>, name: &str) -> Result<Option<MetricKind>> {
        let gauge = tx
            .prepare_cached("SELECT 1 FROM gauges WHERE name = ?1")?
            .query_row([name], |_| Ok(()))
            .optional()?;
        if gauge.is_some() {
            return Ok(Some(MetricKind::Gauge));
        }
        let counter = tx
            .prepare_cached("SELECT 1 FROM counters WHERE name = ?1")?
            .query_row([name], |_| Ok(()))
            .optional()?;
        Ok(counter.map(|_| MetricKind::Counter))
    }

    fn apply(tx: &Transaction<'_>, metric: &Metric) -> Result<MetricValue> {
        metric.validate()?;
        let kind = metric.kind();
        if let Some(stored) = Self::stored_kind(tx, &metric.name)? {
            if stored != kind {
                return Err(StoreError::KindMismatch {
                    name: metric.name.clone(),
                    stored,
                    requested: kind,
                });
            }
        }

        match metric.value {
            MetricValue::Gauge(v) => {
                let stored: f64 = tx
                    .prepare_cached(
                        "INSERT INTO gauges (name, value) VALUES (?1, ?2)
                         ON CONFLICT(name) DO UPDATE SET value = excluded.value
                         RETURNING value",
                    )?
                    .query_row(rusqlite::params![&metric.name, v], |row| row.get(0))?;
                Ok(MetricValue::Gauge(stored))
            }
            MetricValue::Counter(delta) => {
                let current: Option<i64> = tx
                    .prepare_cached("SELECT value FROM counters WHERE name = ?1")?
                    .query_row([&metric.name], |row| row.get(0))
                    .optional()?;
                if current.unwrap_or(0).checked_add(delta).is_none() {
                    return Err(StoreError::Overflow(metric.name.clone()));
                }
                let stored: i64 = tx
                    .prepare_cached(
                        "INSERT INTO counters (name, value) VALUES (?1, ?2)
                         ON CONFLICT(name) DO UPDATE SET value = value + excluded.value
                         RETURNING value",
                    )?
                    .query_row(rusqlite::params![&metric.name, delta], |row| row.get(0))?;
                Ok(MetricValue::Counter(stored))
            }
        }
    }

    fn count_rows(conn: &Connection) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM gauges) + (SELECT COUNT(*) FROM counters)",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

impl MetricStore for SqliteStore {
    fn update(&self, metric: &Metric) -> Result<MetricValue> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stored = Self::apply(&tx, metric)?;
            tx.commit()?;
            Ok(stored)
        })
    }

    fn update_batch(&self, metrics: &[Metric]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for metric in metrics {
                Self::apply(&tx, metric)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn read(&self, name: &str, kind: MetricKind) -> Result<MetricValue> {
        self.with_conn(|conn| {
            let value = match kind {
                MetricKind::Gauge => conn
                    .prepare_cached("SELECT value FROM gauges WHERE name = ?1")?
                    .query_row([name], |row| row.get::<_, f64>(0))
                    .optional()?
                    .map(MetricValue::Gauge),
                MetricKind::Counter => conn
                    .prepare_cached("SELECT value FROM counters WHERE name = ?1")?
                    .query_row([name], |row| row.get::<_, i64>(0))
                    .optional()?
                    .map(MetricValue::Counter),
            };
            value.ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
                kind,
            })
        })
    }

    fn read_all(&self) -> Result<MetricTable> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut table = MetricTable::default();
            {
                let mut stmt = tx.prepare_cached("SELECT name, value FROM gauges")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                for row in rows {
                    let (name, value): (String, f64) = row?;
                    table.gauge.insert(name, value);
                }
            }
            {
                let mut stmt = tx.prepare_cached("SELECT name, value FROM counters")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                for row in rows {
                    let (name, value): (String, i64) = row?;
                    table.counter.insert(name, value);
                }
            }
            tx.commit()?;
            Ok(table)
        })
    }

    fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(conn) = self.lock_conn().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        tracing::info!("SQLite metric store closed");
        Ok(())
    }

    fn restore_from_durable(&self) -> Result<usize> {
        self.with_conn(|conn| Self::count_rows(conn))
    }
}
