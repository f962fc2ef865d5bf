//! Memory compaction: fold low-ranked entries into a single summary row.

use rusqlite::Transaction;
use serde::{Deserialize, Serialize};

use crate::events;
use crate::store::Store;
use crate::types::{
    self, EngineResult, EventKind, MemoryScope, ValueType, MEMORY_SUMMARY_KEY,
};

use super::{clamp_confidence, find_active, map_memory, MEMORY_COLUMNS};

/// Confidence assigned to the summary row.
const SUMMARY_CONFIDENCE: f64 = 0.8;

/// Inputs for [`Store::compact_memory`].
#[derive(Debug, Clone)]
pub struct CompactRequest<'a> {
    pub scope: MemoryScope,
    pub scope_id: &'a str,
    /// Only entries last seen more than this many seconds ago are eligible.
    /// Zero disables the age filter.
    pub max_age_seconds: i64,
    /// Entries ranked inside the top `keep_top` are never compacted.
    pub keep_top: usize,
}

/// Result of a compaction pass, stored verbatim for idempotent replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactOutcome {
    pub event_id: i64,
    pub compacted: i64,
    pub summary_memory_id: Option<i64>,
}

fn compact_in_tx(
    tx: &Transaction<'_>,
    agent: &str,
    req: &CompactRequest<'_>,
) -> EngineResult<CompactOutcome> {
    req.scope.check_scope_id(req.scope_id)?;
    let now = types::now();

    // Candidates: active entries in the scope, the summary row excluded,
    // best first. Victims are everything ranked past keep_top that clears
    // the age filter.
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memory
         WHERE scope = ?1 AND scope_id = ?2
           AND superseded_by IS NULL
           AND canonical_key != ?3
         ORDER BY confidence DESC, last_seen_at DESC, created_at DESC"
    );
    let candidates: Vec<types::MemoryEntry> = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![req.scope.as_str(), req.scope_id, MEMORY_SUMMARY_KEY],
            map_memory,
        )?;
        rows.collect::<Result<_, _>>()?
    };

    let cutoff = now - chrono::Duration::seconds(req.max_age_seconds.max(0));
    let victims: Vec<&types::MemoryEntry> = candidates
        .iter()
        .skip(req.keep_top)
        .filter(|entry| req.max_age_seconds <= 0 || entry.last_seen_at < cutoff)
        .collect();

    if victims.is_empty() {
        let metadata = serde_json::json!({
            "scope": req.scope.as_str(),
            "scope_id": req.scope_id,
            "compacted_count": 0,
        });
        let event = events::insert_resolved(
            tx,
            agent,
            EventKind::MemoryCompacted,
            None,
            &format!("memory compaction in {} scope found nothing to fold", req.scope),
            Some(&metadata.to_string()),
        )?;
        return Ok(CompactOutcome {
            event_id: event.id,
            compacted: 0,
            summary_memory_id: None,
        });
    }

    let payload = serde_json::json!({
        "compacted_count": victims.len(),
        "generated_at": types::to_db_time(now),
        "entries": victims
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "key": entry.key,
                    "value": entry.value,
                    "value_type": entry.value_type.as_str(),
                })
            })
            .collect::<Vec<_>>(),
    })
    .to_string();

    let summary_id = write_summary_row(tx, req.scope, req.scope_id, &payload, now)?;
    let marker = format!("memory_{summary_id}");
    let mut compacted = 0i64;
    for victim in &victims {
        compacted += tx.execute(
            "UPDATE memory SET superseded_by = ?1 WHERE id = ?2 AND superseded_by IS NULL",
            rusqlite::params![marker, victim.id],
        )? as i64;
    }

    let metadata = serde_json::json!({
        "scope": req.scope.as_str(),
        "scope_id": req.scope_id,
        "compacted_count": compacted,
        "keep_top": req.keep_top,
        "max_age_seconds": req.max_age_seconds,
        "summary_memory_id": summary_id,
    });
    let event = events::insert_resolved(
        tx,
        agent,
        EventKind::MemoryCompacted,
        None,
        &format!(
            "compacted {} memory entries in {} scope into {marker}",
            compacted, req.scope
        ),
        Some(&metadata.to_string()),
    )?;
    tracing::info!(
        agent,
        scope = req.scope.as_str(),
        scope_id = req.scope_id,
        compacted,
        "memory compaction"
    );

    Ok(CompactOutcome {
        event_id: event.id,
        compacted,
        summary_memory_id: Some(summary_id),
    })
}

/// Write or refresh the single active summary row for the scope.
fn write_summary_row(
    tx: &Transaction<'_>,
    scope: MemoryScope,
    scope_id: &str,
    payload: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> EngineResult<i64> {
    let db_now = types::to_db_time(now);
    if let Some(existing) = find_active(tx, scope, scope_id, MEMORY_SUMMARY_KEY)? {
        tx.execute(
            "UPDATE memory
             SET value = ?1, value_type = 'json', confidence = ?2, last_seen_at = ?3
             WHERE id = ?4",
            rusqlite::params![payload, clamp_confidence(SUMMARY_CONFIDENCE), db_now, existing.id],
        )?;
        return Ok(existing.id);
    }
    tx.execute(
        "INSERT INTO memory (key, canonical_key, value, value_type, scope, scope_id,
                             confidence, last_seen_at, created_at)
         VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        rusqlite::params![
            MEMORY_SUMMARY_KEY,
            payload,
            ValueType::Json.as_str(),
            scope.as_str(),
            scope_id,
            clamp_confidence(SUMMARY_CONFIDENCE),
            db_now,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

impl Store {
    /// Idempotent compaction: fold entries ranked past `keep_top` (and older
    /// than `max_age_seconds`, when set) into the scope's single summary
    /// row, superseding the originals.
    pub async fn compact_memory(
        &self,
        agent: &str,
        request: &str,
        req: CompactRequest<'_>,
    ) -> EngineResult<CompactOutcome> {
        self.run_idempotent(agent, request, "compact_memory", |tx| {
            compact_in_tx(tx, agent, &req)
        })
        .await
    }
}
