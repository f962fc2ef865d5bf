//! Store handle: connection ownership, pragmas, and the transaction kernel.
//!
//! The handle owns a single writer connection behind an async mutex. Every
//! write runs inside one immediate-mode transaction executed synchronously
//! while the lock is held, so a transaction is the unit of suspension and
//! nothing suspends mid-attempt. Reads share the WAL snapshot through the
//! same connection.

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::types::{CheckpointMode, EngineResult};

pub mod migrations;
pub mod retry;

pub use retry::{with_backoff, Backoff, RetryPolicy};

static MEM_STORE_SEQ: AtomicU64 = AtomicU64::new(0);

struct StoreInner {
    conn: Mutex<Connection>,
    config: StoreConfig,
    in_memory: bool,
}

/// Handle to one on-disk (or in-memory) coordination store.
///
/// Cheap to clone; clones share the writer connection.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Row counts and schema position, for operator surfaces.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreStatus {
    pub schema_version: i64,
    pub latest_version: i64,
    pub projects: i64,
    pub tasks: i64,
    pub events: i64,
    pub memory_entries: i64,
    pub artifacts: i64,
    pub agents: i64,
    pub idempotency_keys: i64,
}

impl Store {
    /// Open (or create) the store at the configured path, applying pragmas
    /// and the migration lifecycle.
    pub async fn open(config: StoreConfig) -> EngineResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(&config.path)?;
        apply_pragmas(&conn, &config, false)?;
        migrations::ensure_schema(&mut conn, &config)?;

        tracing::info!(path = %config.path.display(), "opened coordination store");
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                config,
                in_memory: false,
            }),
        })
    }

    /// Open a private in-memory store (used by tests and ephemeral runs).
    ///
    /// Uses a shared-cache URI and skips immediate-lock transactions, which
    /// would deadlock migration sub-queries on a memory database.
    pub async fn open_in_memory() -> EngineResult<Self> {
        let seq = MEM_STORE_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:vybe_mem_{seq}?mode=memory&cache=shared");
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let mut conn = Connection::open_with_flags(uri, flags)?;
        let config = StoreConfig::new(PathBuf::from(":memory:"));
        apply_pragmas(&conn, &config, true)?;
        migrations::apply_all(&mut conn)?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                config,
                in_memory: true,
            }),
        })
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.config.retry
    }

    /// Run one write transaction. The closure may be re-run by the retry
    /// kernel on busy/locked contention or the idempotency in-progress
    /// sentinel; everything else surfaces immediately. The transaction opens
    /// in immediate mode so the writer lock is taken at transaction start.
    pub(crate) async fn write_tx<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: Fn(&Transaction<'_>) -> EngineResult<T>,
    {
        with_backoff(self.retry_policy(), || async {
            let mut conn = self.inner.conn.lock().await;
            let tx = if self.inner.in_memory {
                conn.transaction()?
            } else {
                conn.transaction_with_behavior(TransactionBehavior::Immediate)?
            };
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Run a read-only closure against the connection.
    pub(crate) async fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Connection) -> EngineResult<T>,
    {
        let conn = self.inner.conn.lock().await;
        f(&conn)
    }

    /// Applied and latest schema versions.
    pub async fn schema_version(&self) -> EngineResult<(i64, i64)> {
        self.read(|conn| {
            Ok((
                migrations::current_version(conn)?,
                migrations::latest_version(),
            ))
        })
        .await
    }

    /// Row counts per entity plus schema position.
    pub async fn status(&self) -> EngineResult<StoreStatus> {
        self.read(|conn| {
            let count = |table: &str| -> EngineResult<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
            };
            Ok(StoreStatus {
                schema_version: migrations::current_version(conn)?,
                latest_version: migrations::latest_version(),
                projects: count("projects")?,
                tasks: count("tasks")?,
                events: count("events")?,
                memory_entries: count("memory")?,
                artifacts: count("artifacts")?,
                agents: count("agent_state")?,
                idempotency_keys: count("idempotency")?,
            })
        })
        .await
    }

    /// Run a WAL checkpoint in one of the four supported modes. Any other
    /// mode string is rejected at the [`CheckpointMode`] boundary.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> EngineResult<()> {
        self.read(|conn| {
            let sql = format!("PRAGMA wal_checkpoint({})", mode.as_str());
            // wal_checkpoint returns (busy, log_pages, checkpointed_pages).
            let (busy, log, done): (i64, i64, i64) =
                conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            tracing::debug!(mode = mode.as_str(), busy, log, done, "wal checkpoint");
            Ok(())
        })
        .await
    }

    /// Graceful close: run the query-planner optimisation pass, then drop
    /// this handle's reference to the connection. The connection itself
    /// closes when the last clone goes away.
    pub async fn close(self) -> EngineResult<()> {
        {
            let conn = self.inner.conn.lock().await;
            conn.execute_batch("PRAGMA optimize;")?;
        }
        tracing::info!("coordination store closed");
        Ok(())
    }
}

/// Wrap a row-decoding failure so it can flow through rusqlite's mapped
/// query plumbing.
pub(crate) fn row_error(
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn apply_pragmas(conn: &Connection, config: &StoreConfig, in_memory: bool) -> EngineResult<()> {
    conn.busy_timeout(config.busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if !in_memory {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 64 * 1024 * 1024i64)?;
    // Negative cache_size is KiB: ~8 MiB of page cache.
    conn.pragma_update(None, "cache_size", -8192i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    Ok(())
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.config.path)
            .field("in_memory", &self.inner.in_memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_applies_schema() {
        let store = Store::open_in_memory().await.unwrap();
        let (current, latest) = store.schema_version().await.unwrap();
        assert_eq!(current, latest);
        let status = store.status().await.unwrap();
        assert_eq!(status.tasks, 0);
        assert_eq!(status.events, 0);
    }

    #[tokio::test]
    async fn open_file_store_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vybe.db");

        let store = Store::open(StoreConfig::new(&path)).await.unwrap();
        let (current, latest) = store.schema_version().await.unwrap();
        assert_eq!(current, latest);
        store.checkpoint(CheckpointMode::Truncate).await.unwrap();
        store.close().await.unwrap();

        // Reopen without auto-migrate: schema is already current.
        let reopened = Store::open(StoreConfig::new(&path).with_auto_migrate(false))
            .await
            .unwrap();
        let (current, latest) = reopened.schema_version().await.unwrap();
        assert_eq!(current, latest);
    }

    #[tokio::test]
    async fn write_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().await.unwrap();
        let result: EngineResult<()> = store
            .write_tx(|tx| {
                tx.execute(
                    "INSERT INTO projects (id, name, created_at) VALUES ('proj_x', 'x', '2026-01-01T00:00:00.000000Z')",
                    [],
                )?;
                Err(crate::types::EngineError::validation("boom"))
            })
            .await;
        assert!(result.is_err());
        let status = store.status().await.unwrap();
        assert_eq!(status.projects, 0);
    }
}
