//! Scoped key/value memory with canonical deduplication, confidence, and
//! reinforcement.
//!
//! One active (non-superseded) row exists per `(scope, scope_id,
//! canonical_key)`, enforced by a partial unique index at the storage layer.
//! Writers that lose the insert race follow a re-read-and-update path that
//! preserves reinforcement semantics.

use rusqlite::Transaction;
use serde::{Deserialize, Serialize};

use crate::events;
use crate::store::Store;
use crate::types::{
    self, EngineError, EngineResult, EventKind, MemoryEntry, MemoryScope, ValueType,
    DEFAULT_CONFIDENCE, REINFORCEMENT_BUMP,
};

pub mod compaction;

pub use compaction::{CompactOutcome, CompactRequest};

/// Normalize a memory key into its deduplication identity: trim, lowercase,
/// collapse whitespace runs to a single underscore, and keep only
/// `[a-z0-9_-]`.
pub fn canonical_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_ws = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            pending_ws = true;
            continue;
        }
        for lower in ch.to_lowercase() {
            if lower.is_ascii_lowercase() || lower.is_ascii_digit() || lower == '_' || lower == '-'
            {
                if pending_ws && !out.is_empty() {
                    out.push('_');
                }
                pending_ws = false;
                out.push(lower);
            }
        }
    }
    out
}

pub(crate) fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(0.0, 1.0)
}

/// Inputs for [`Store::upsert_memory`].
#[derive(Debug, Clone)]
pub struct UpsertMemory<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub value_type: ValueType,
    pub scope: MemoryScope,
    pub scope_id: &'a str,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Overrides both the fresh-insert default and the reinforcement bump.
    pub confidence: Option<f64>,
    pub source_event_id: Option<i64>,
}

impl<'a> UpsertMemory<'a> {
    pub fn new(key: &'a str, value: &'a str, scope: MemoryScope, scope_id: &'a str) -> Self {
        Self {
            key,
            value,
            value_type: ValueType::infer(value),
            scope,
            scope_id,
            expires_at: None,
            confidence: None,
            source_event_id: None,
        }
    }
}

/// Result of an upsert, stored verbatim for idempotent replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpsertOutcome {
    pub event_id: i64,
    pub reinforced: bool,
    pub confidence: f64,
    pub canonical_key: String,
}

/// Result of a touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchOutcome {
    pub event_id: i64,
    pub confidence: f64,
}

/// Result of a GC pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcOutcome {
    pub event_id: i64,
    pub deleted: i64,
}

pub(crate) const MEMORY_COLUMNS: &str = "id, key, canonical_key, value, value_type, scope, \
     scope_id, confidence, last_seen_at, source_event_id, superseded_by, expires_at, created_at";

pub(crate) fn map_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let value_type_raw: String = row.get(4)?;
    let scope_raw: String = row.get(5)?;
    let last_seen_raw: String = row.get(8)?;
    let expires_raw: Option<String> = row.get(11)?;
    let created_raw: String = row.get(12)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        key: row.get(1)?,
        canonical_key: row.get(2)?,
        value: row.get(3)?,
        value_type: ValueType::parse(&value_type_raw).map_err(crate::store::row_error)?,
        scope: MemoryScope::parse(&scope_raw).map_err(crate::store::row_error)?,
        scope_id: row.get(6)?,
        confidence: row.get(7)?,
        last_seen_at: types::from_db_time(&last_seen_raw).map_err(crate::store::row_error)?,
        source_event_id: row.get(9)?,
        superseded_by: row.get(10)?,
        expires_at: expires_raw
            .map(|raw| types::from_db_time(&raw).map_err(crate::store::row_error))
            .transpose()?,
        created_at: types::from_db_time(&created_raw).map_err(crate::store::row_error)?,
    })
}

/// Active row for a canonical key, ignoring expiry: an expired row still
/// holds the uniqueness slot until GC removes it.
pub(crate) fn find_active(
    tx: &Transaction<'_>,
    scope: MemoryScope,
    scope_id: &str,
    canonical: &str,
) -> EngineResult<Option<MemoryEntry>> {
    use rusqlite::OptionalExtension;
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memory
         WHERE scope = ?1 AND scope_id = ?2 AND canonical_key = ?3
           AND superseded_by IS NULL"
    );
    Ok(tx
        .query_row(
            &sql,
            rusqlite::params![scope.as_str(), scope_id, canonical],
            map_memory,
        )
        .optional()?)
}

fn emit_memory_event(
    tx: &Transaction<'_>,
    agent: &str,
    kind: EventKind,
    scope: MemoryScope,
    scope_id: &str,
    message: &str,
    metadata: &serde_json::Value,
) -> EngineResult<i64> {
    let meta = metadata.to_string();
    let event = match scope {
        MemoryScope::Task => {
            events::insert_resolved(tx, agent, kind, Some(scope_id), message, Some(&meta))?
        }
        MemoryScope::Project => {
            events::insert_direct(tx, agent, kind, Some(scope_id), None, message, Some(&meta))?
        }
        _ => events::insert_resolved(tx, agent, kind, None, message, Some(&meta))?,
    };
    Ok(event.id)
}

fn upsert_in_tx(
    tx: &Transaction<'_>,
    agent: &str,
    req: &UpsertMemory<'_>,
) -> EngineResult<MemoryUpsertOutcome> {
    req.scope.check_scope_id(req.scope_id)?;
    if req.key.trim().is_empty() {
        return Err(EngineError::validation("memory key must not be empty"));
    }
    let canonical = canonical_key(req.key);
    if canonical.is_empty() {
        return Err(EngineError::validation(
            "memory key canonicalizes to the empty string",
        ));
    }

    let existing = match find_active(tx, req.scope, req.scope_id, &canonical)? {
        Some(row) => Some(row),
        None => match try_insert(tx, req, &canonical)? {
            InsertResult::Inserted => None,
            InsertResult::Conflict => {
                // Lost a race on the canonical index, or a superseded row
                // holds the raw key. Re-read, revive, or re-insert once.
                match find_active(tx, req.scope, req.scope_id, &canonical)? {
                    Some(row) => Some(row),
                    None => {
                        if revive_by_raw_key(tx, req, &canonical)? {
                            None
                        } else {
                            match try_insert(tx, req, &canonical)? {
                                InsertResult::Inserted => None,
                                InsertResult::Conflict => {
                                    return Err(EngineError::validation(format!(
                                        "memory upsert for {canonical:?} keeps conflicting"
                                    )))
                                }
                            }
                        }
                    }
                }
            }
        },
    };

    let (reinforced, confidence) = match &existing {
        None => (
            false,
            clamp_confidence(req.confidence.unwrap_or(DEFAULT_CONFIDENCE)),
        ),
        Some(row) => {
            let reinforced = row.value == req.value && row.value_type == req.value_type;
            let confidence = match req.confidence {
                Some(explicit) => clamp_confidence(explicit),
                None if reinforced => clamp_confidence(row.confidence + REINFORCEMENT_BUMP),
                None => row.confidence,
            };
            tx.execute(
                "UPDATE memory
                 SET value = ?1, value_type = ?2, confidence = ?3, last_seen_at = ?4,
                     expires_at = ?5, source_event_id = COALESCE(?6, source_event_id)
                 WHERE id = ?7",
                rusqlite::params![
                    req.value,
                    req.value_type.as_str(),
                    confidence,
                    types::to_db_time(types::now()),
                    req.expires_at.map(types::to_db_time),
                    req.source_event_id,
                    row.id,
                ],
            )?;
            (reinforced, confidence)
        }
    };

    let kind = if reinforced {
        EventKind::MemoryReinforced
    } else {
        EventKind::MemoryUpserted
    };
    let metadata = serde_json::json!({
        "key": req.key,
        "canonical_key": canonical,
        "value_type": req.value_type.as_str(),
        "scope": req.scope.as_str(),
        "scope_id": req.scope_id,
        "expires_at": req.expires_at.map(types::to_db_time),
        "reinforced": reinforced,
        "confidence": confidence,
    });
    let message = format!(
        "memory {} {} in {} scope",
        canonical,
        if reinforced { "reinforced" } else { "upserted" },
        req.scope
    );
    let event_id = emit_memory_event(tx, agent, kind, req.scope, req.scope_id, &message, &metadata)?;

    Ok(MemoryUpsertOutcome {
        event_id,
        reinforced,
        confidence,
        canonical_key: canonical,
    })
}

enum InsertResult {
    Inserted,
    Conflict,
}

fn try_insert(
    tx: &Transaction<'_>,
    req: &UpsertMemory<'_>,
    canonical: &str,
) -> EngineResult<InsertResult> {
    let now = types::to_db_time(types::now());
    let confidence = clamp_confidence(req.confidence.unwrap_or(DEFAULT_CONFIDENCE));
    let result = tx.execute(
        "INSERT INTO memory (key, canonical_key, value, value_type, scope, scope_id,
                             confidence, last_seen_at, source_event_id, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            req.key,
            canonical,
            req.value,
            req.value_type.as_str(),
            req.scope.as_str(),
            req.scope_id,
            confidence,
            now,
            req.source_event_id,
            req.expires_at.map(types::to_db_time),
            now,
        ],
    );
    match result {
        Ok(_) => Ok(InsertResult::Inserted),
        Err(e) if crate::types::error::is_unique_violation(&e) => Ok(InsertResult::Conflict),
        Err(e) => Err(e.into()),
    }
}

/// A superseded row may still hold the `(scope, scope_id, key)` slot. A
/// fresh upsert of that key revives it as a new active entry.
fn revive_by_raw_key(
    tx: &Transaction<'_>,
    req: &UpsertMemory<'_>,
    canonical: &str,
) -> EngineResult<bool> {
    let now = types::to_db_time(types::now());
    let confidence = clamp_confidence(req.confidence.unwrap_or(DEFAULT_CONFIDENCE));
    let updated = tx.execute(
        "UPDATE memory
         SET canonical_key = ?1, value = ?2, value_type = ?3, confidence = ?4,
             last_seen_at = ?5, superseded_by = NULL, expires_at = ?6,
             source_event_id = ?7
         WHERE scope = ?8 AND scope_id = ?9 AND key = ?10",
        rusqlite::params![
            canonical,
            req.value,
            req.value_type.as_str(),
            confidence,
            now,
            req.expires_at.map(types::to_db_time),
            req.source_event_id,
            req.scope.as_str(),
            req.scope_id,
            req.key,
        ],
    )?;
    Ok(updated == 1)
}

impl Store {
    /// Idempotent upsert with event emission. Reinforcement (same value and
    /// type as the active row) bumps confidence by +0.05 unless the caller
    /// overrides it; a non-reinforcing update preserves the existing
    /// confidence.
    pub async fn upsert_memory(
        &self,
        agent: &str,
        request: &str,
        req: UpsertMemory<'_>,
    ) -> EngineResult<MemoryUpsertOutcome> {
        self.run_idempotent(agent, request, "upsert_memory", |tx| {
            upsert_in_tx(tx, agent, &req)
        })
        .await
    }

    /// The unique active row for the key, excluding superseded and expired
    /// entries. Lookups canonicalize the key the same way writes do.
    pub async fn get_memory(
        &self,
        key: &str,
        scope: MemoryScope,
        scope_id: &str,
    ) -> EngineResult<Option<MemoryEntry>> {
        scope.check_scope_id(scope_id)?;
        let canonical = canonical_key(key);
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory
             WHERE scope = ?1 AND scope_id = ?2 AND canonical_key = ?3
               AND superseded_by IS NULL
               AND (expires_at IS NULL OR expires_at > ?4)"
        );
        self.read(|conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    &sql,
                    rusqlite::params![
                        scope.as_str(),
                        scope_id,
                        canonical,
                        types::to_db_time(types::now()),
                    ],
                    map_memory,
                )
                .optional()?)
        })
        .await
    }

    /// Variant of [`Store::get_memory`] that also returns superseded or
    /// expired rows (most recent first).
    pub async fn get_memory_any(
        &self,
        key: &str,
        scope: MemoryScope,
        scope_id: &str,
    ) -> EngineResult<Option<MemoryEntry>> {
        scope.check_scope_id(scope_id)?;
        let canonical = canonical_key(key);
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory
             WHERE scope = ?1 AND scope_id = ?2 AND canonical_key = ?3
             ORDER BY superseded_by IS NULL DESC, id DESC LIMIT 1"
        );
        self.read(|conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    &sql,
                    rusqlite::params![scope.as_str(), scope_id, canonical],
                    map_memory,
                )
                .optional()?)
        })
        .await
    }

    /// Active, unexpired rows in a scope, highest confidence first and most
    /// recently seen within equal confidence.
    pub async fn list_memory(
        &self,
        scope: MemoryScope,
        scope_id: &str,
    ) -> EngineResult<Vec<MemoryEntry>> {
        scope.check_scope_id(scope_id)?;
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory
             WHERE scope = ?1 AND scope_id = ?2
               AND superseded_by IS NULL
               AND (expires_at IS NULL OR expires_at > ?3)
             ORDER BY confidence DESC, last_seen_at DESC"
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![scope.as_str(), scope_id, types::to_db_time(types::now())],
                map_memory,
            )?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    /// Contains-match over both the raw and the canonical key. Prefix
    /// patterns can lean on the canonical index.
    pub async fn query_memory(
        &self,
        scope: MemoryScope,
        scope_id: &str,
        pattern: &str,
        limit: i64,
    ) -> EngineResult<Vec<MemoryEntry>> {
        scope.check_scope_id(scope_id)?;
        let like = format!("%{pattern}%");
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory
             WHERE scope = ?1 AND scope_id = ?2
               AND superseded_by IS NULL
               AND (expires_at IS NULL OR expires_at > ?3)
               AND (key LIKE ?4 OR canonical_key LIKE ?4)
             ORDER BY confidence DESC, last_seen_at DESC
             LIMIT ?5"
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![
                    scope.as_str(),
                    scope_id,
                    types::to_db_time(types::now()),
                    like,
                    limit,
                ],
                map_memory,
            )?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    /// Idempotent touch: refresh `last_seen_at` and bump confidence by
    /// `delta` on an active row. Fails if the row is missing or superseded.
    pub async fn touch_memory(
        &self,
        agent: &str,
        request: &str,
        key: &str,
        scope: MemoryScope,
        scope_id: &str,
        delta: f64,
    ) -> EngineResult<TouchOutcome> {
        if !(0.0..=1.0).contains(&delta) {
            return Err(EngineError::validation(
                "touch delta must be between 0 and 1",
            ));
        }
        scope.check_scope_id(scope_id)?;
        let canonical = canonical_key(key);

        self.run_idempotent(agent, request, "touch_memory", |tx| {
            let row = find_active(tx, scope, scope_id, &canonical)?.ok_or_else(|| {
                EngineError::NotFound {
                    entity: "memory entry",
                    id: format!("{}/{}/{}", scope, scope_id, canonical),
                }
            })?;
            let confidence = clamp_confidence(row.confidence + delta);
            tx.execute(
                "UPDATE memory SET last_seen_at = ?1, confidence = ?2 WHERE id = ?3",
                rusqlite::params![types::to_db_time(types::now()), confidence, row.id],
            )?;
            let metadata = serde_json::json!({
                "key": row.key,
                "canonical_key": canonical,
                "scope": scope.as_str(),
                "scope_id": scope_id,
                "delta": delta,
                "confidence": confidence,
            });
            let message = format!("memory {canonical} touched");
            let event_id = emit_memory_event(
                tx,
                agent,
                EventKind::MemoryTouched,
                scope,
                scope_id,
                &message,
                &metadata,
            )?;
            Ok(TouchOutcome {
                event_id,
                confidence,
            })
        })
        .await
    }

    /// Idempotent delete of exactly one row `(key, scope, scope_id)`.
    pub async fn delete_memory(
        &self,
        agent: &str,
        request: &str,
        key: &str,
        scope: MemoryScope,
        scope_id: &str,
    ) -> EngineResult<i64> {
        scope.check_scope_id(scope_id)?;
        self.run_idempotent(agent, request, "delete_memory", |tx| {
            delete_in_tx(tx, agent, key, scope, scope_id)
        })
        .await
    }

    /// Non-idempotent delete variant; fails with `NOT_FOUND` on re-delete.
    pub async fn delete_memory_now(
        &self,
        agent: &str,
        key: &str,
        scope: MemoryScope,
        scope_id: &str,
    ) -> EngineResult<i64> {
        scope.check_scope_id(scope_id)?;
        self.write_tx(|tx| delete_in_tx(tx, agent, key, scope, scope_id))
            .await
    }

    /// Idempotent GC: delete at most `limit` rows whose expiry has passed or
    /// that are superseded, oldest ids first.
    pub async fn gc_memory(&self, agent: &str, request: &str, limit: i64) -> EngineResult<GcOutcome> {
        if limit <= 0 {
            return Err(EngineError::validation("gc limit must be positive"));
        }
        self.run_idempotent(agent, request, "gc_memory", |tx| {
            let deleted = tx.execute(
                "DELETE FROM memory WHERE id IN (
                    SELECT id FROM memory
                    WHERE (expires_at IS NOT NULL AND expires_at <= ?1)
                       OR superseded_by IS NOT NULL
                    ORDER BY id ASC LIMIT ?2
                 )",
                rusqlite::params![types::to_db_time(types::now()), limit],
            )? as i64;
            let metadata = serde_json::json!({ "deleted": deleted });
            let event = events::insert_resolved(
                tx,
                agent,
                EventKind::MemoryGc,
                None,
                &format!("memory gc removed {deleted} rows"),
                Some(&metadata.to_string()),
            )?;
            tracing::debug!(agent, deleted, "memory gc");
            Ok(GcOutcome {
                event_id: event.id,
                deleted,
            })
        })
        .await
    }
}

fn delete_in_tx(
    tx: &Transaction<'_>,
    agent: &str,
    key: &str,
    scope: MemoryScope,
    scope_id: &str,
) -> EngineResult<i64> {
    let deleted = tx.execute(
        "DELETE FROM memory WHERE scope = ?1 AND scope_id = ?2 AND key = ?3",
        rusqlite::params![scope.as_str(), scope_id, key],
    )?;
    if deleted == 0 {
        return Err(EngineError::NotFound {
            entity: "memory entry",
            id: format!("{scope}/{scope_id}/{key}"),
        });
    }
    let metadata = serde_json::json!({
        "key": key,
        "scope": scope.as_str(),
        "scope_id": scope_id,
    });
    let message = format!("memory {key} deleted");
    let event_id = emit_memory_event(
        tx,
        agent,
        EventKind::MemoryDelete,
        scope,
        scope_id,
        &message,
        &metadata,
    )?;
    Ok(event_id)
}
