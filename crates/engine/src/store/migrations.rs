//! Embedded, versioned schema migrations.
//!
//! Migrations are numbered and applied in order under an exclusive advisory
//! file lock (`<path>.migrate.lock`) so concurrent processes serialize; the
//! lock is skipped for in-memory stores. The applied version lives in
//! `PRAGMA user_version`. Each migration runs inside its own transaction.

use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};

use crate::config::StoreConfig;
use crate::types::{EngineError, EngineResult};

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Transaction<'_>) -> EngineResult<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        apply: initial_schema,
    },
    Migration {
        version: 2,
        name: "canonical_memory_index",
        apply: canonical_memory_index,
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Currently applied schema version.
pub fn current_version(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring a file-backed store to the latest schema, honouring the
/// configuration's auto-migrate switch and serializing against concurrent
/// processes via the advisory lock.
pub fn ensure_schema(conn: &mut Connection, config: &StoreConfig) -> EngineResult<()> {
    let current = current_version(conn)?;
    let latest = latest_version();
    if current == latest {
        return Ok(());
    }
    if !config.auto_migrate {
        return Err(EngineError::SchemaMismatch { current, latest });
    }

    let lock_path = lock_file_path(&config.path);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let mut lock = fd_lock::RwLock::new(file);
    let _guard = lock.write()?;

    // Another process may have migrated while we waited on the lock.
    apply_pending(conn)
}

/// Apply all pending migrations without taking the advisory lock (in-memory
/// stores, or callers already holding it).
pub fn apply_all(conn: &mut Connection) -> EngineResult<()> {
    apply_pending(conn)
}

fn apply_pending(conn: &mut Connection) -> EngineResult<()> {
    let mut current = current_version(conn)?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied migration"
        );
        current = migration.version;
    }
    Ok(())
}

fn lock_file_path(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_owned();
    os.push(".migrate.lock");
    PathBuf::from(os)
}

// ── Migration 1: initial schema ───────────────────────────────────────

fn initial_schema(tx: &Transaction<'_>) -> EngineResult<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS projects (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            metadata    TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id               TEXT PRIMARY KEY,
            title            TEXT NOT NULL,
            description      TEXT NOT NULL DEFAULT '',
            status           TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','in_progress','completed','blocked')),
            priority         INTEGER NOT NULL DEFAULT 0,
            project_id       TEXT REFERENCES projects(id),
            blocked_reason   TEXT,
            claimed_by       TEXT,
            claimed_at       TEXT,
            claim_expires_at TEXT,
            version          INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, priority, created_at);

        CREATE TABLE IF NOT EXISTS task_dependencies (
            task_id            TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            depends_on_task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            created_at         TEXT NOT NULL,
            PRIMARY KEY (task_id, depends_on_task_id)
        );
        CREATE INDEX IF NOT EXISTS idx_task_deps_depends_on
            ON task_dependencies(depends_on_task_id);

        -- Append-only log. No foreign keys: history outlives the rows it
        -- references.
        CREATE TABLE IF NOT EXISTS events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            kind        TEXT NOT NULL,
            agent_name  TEXT NOT NULL,
            project_id  TEXT,
            task_id     TEXT,
            message     TEXT NOT NULL,
            metadata    TEXT,
            created_at  TEXT NOT NULL,
            archived_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id);
        CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
        CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
        CREATE INDEX IF NOT EXISTS idx_events_archived ON events(archived_at);

        CREATE TABLE IF NOT EXISTS memory (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            key             TEXT NOT NULL,
            canonical_key   TEXT NOT NULL,
            value           TEXT NOT NULL,
            value_type      TEXT NOT NULL
                CHECK (value_type IN ('string','number','boolean','json','array')),
            scope           TEXT NOT NULL
                CHECK (scope IN ('global','project','task','agent')),
            scope_id        TEXT NOT NULL DEFAULT '',
            confidence      REAL NOT NULL DEFAULT 0.5,
            last_seen_at    TEXT NOT NULL,
            source_event_id INTEGER,
            superseded_by   TEXT,
            expires_at      TEXT,
            created_at      TEXT NOT NULL,
            UNIQUE (scope, scope_id, key)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_scope ON memory(scope, scope_id);
        CREATE INDEX IF NOT EXISTS idx_memory_canonical
            ON memory(scope, scope_id, canonical_key);

        CREATE TABLE IF NOT EXISTS artifacts (
            id           TEXT PRIMARY KEY,
            task_id      TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            project_id   TEXT,
            event_id     INTEGER NOT NULL,
            file_path    TEXT NOT NULL,
            content_type TEXT,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id);

        CREATE TABLE IF NOT EXISTS agent_state (
            agent_name         TEXT PRIMARY KEY,
            last_seen_event_id INTEGER NOT NULL DEFAULT 0,
            focus_task_id      TEXT,
            focus_project_id   TEXT,
            version            INTEGER NOT NULL DEFAULT 1,
            last_active_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS idempotency (
            agent_name  TEXT NOT NULL,
            request_id  TEXT NOT NULL,
            command     TEXT NOT NULL,
            result_json TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL,
            PRIMARY KEY (agent_name, request_id)
        );",
    )?;
    Ok(())
}

// ── Migration 2: canonical-key uniqueness ─────────────────────────────

/// Re-normalize every canonical key, supersede collision losers, and create
/// the partial unique index that enforces one active row per
/// `(scope, scope_id, canonical_key)` from here on. All in one transaction.
fn canonical_memory_index(tx: &Transaction<'_>) -> EngineResult<()> {
    reconcile_canonical_keys(tx)?;
    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_memory_canonical_active
            ON memory(scope, scope_id, canonical_key)
            WHERE superseded_by IS NULL;",
    )?;
    Ok(())
}

fn reconcile_canonical_keys(tx: &Transaction<'_>) -> EngineResult<()> {
    // Pass 1: re-normalize stored canonical keys.
    let rows: Vec<(i64, String, String)> = {
        let mut stmt = tx.prepare("SELECT id, key, canonical_key FROM memory")?;
        let mapped = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        mapped.collect::<Result<_, _>>()?
    };
    for (id, key, stored) in &rows {
        let normalized = crate::memory::canonical_key(key);
        if normalized != *stored {
            tx.execute(
                "UPDATE memory SET canonical_key = ?1 WHERE id = ?2",
                rusqlite::params![normalized, id],
            )?;
        }
    }

    // Pass 2: per collision group, keep the winner (highest confidence, then
    // most recent last_seen, then highest id) and supersede the rest.
    let groups: Vec<(String, String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT scope, scope_id, canonical_key FROM memory
             WHERE superseded_by IS NULL
             GROUP BY scope, scope_id, canonical_key
             HAVING COUNT(*) > 1",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        mapped.collect::<Result<_, _>>()?
    };
    for (scope, scope_id, canonical) in groups {
        let winner: i64 = tx.query_row(
            "SELECT id FROM memory
             WHERE scope = ?1 AND scope_id = ?2 AND canonical_key = ?3
               AND superseded_by IS NULL
             ORDER BY confidence DESC, last_seen_at DESC, id DESC
             LIMIT 1",
            rusqlite::params![scope, scope_id, canonical],
            |row| row.get(0),
        )?;
        let superseded = tx.execute(
            "UPDATE memory SET superseded_by = ?1
             WHERE scope = ?2 AND scope_id = ?3 AND canonical_key = ?4
               AND superseded_by IS NULL AND id != ?5",
            rusqlite::params![format!("memory_{winner}"), scope, scope_id, canonical, winner],
        )?;
        tracing::debug!(
            scope = %scope,
            canonical = %canonical,
            winner,
            superseded,
            "reconciled canonical-key collision group"
        );
    }
    Ok(())
}
