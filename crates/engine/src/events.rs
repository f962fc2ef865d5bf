//! Append-only event log: validation, insertion, scoping, and archival.
//!
//! Event ids are assigned by the store in insertion order and are the global
//! ordering primitive agents use to reason about causality. Rows are never
//! mutated after insert except for `archived_at`.

use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};

use crate::store::Store;
use crate::types::{self, EngineError, EngineResult, Event, EventKind};

/// Maximum lengths accepted by event validation, after trimming.
pub const MAX_KIND_LEN: usize = 128;
pub const MAX_AGENT_LEN: usize = 128;
pub const MAX_MESSAGE_LEN: usize = 4096;
pub const MAX_METADATA_BYTES: usize = 16384;

/// Query filter for [`Store::list_events`]. A set `project_id` applies the
/// strict project scope (`project_id = ?`).
#[derive(Debug, Clone, Default)]
pub struct EventFilter<'a> {
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub kind: Option<EventKind>,
    pub since_id: Option<i64>,
    pub include_archived: bool,
    pub limit: Option<i64>,
}

/// Inputs for [`Store::archive_events`].
#[derive(Debug, Clone)]
pub struct ArchiveRequest<'a> {
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub from_id: i64,
    pub to_id: i64,
    pub summary: &'a str,
}

/// Result of an archival pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub summary_event_id: i64,
    pub archived_count: i64,
}

pub(crate) fn validate(agent: &str, message: &str, metadata: Option<&str>) -> EngineResult<()> {
    let agent = agent.trim();
    if agent.is_empty() {
        return Err(EngineError::validation("agent name must not be empty"));
    }
    if agent.len() > MAX_AGENT_LEN {
        return Err(EngineError::validation(format!(
            "agent name exceeds {MAX_AGENT_LEN} characters"
        )));
    }
    let message = message.trim();
    if message.is_empty() {
        return Err(EngineError::validation("event message must not be empty"));
    }
    if message.len() > MAX_MESSAGE_LEN {
        return Err(EngineError::validation(format!(
            "event message exceeds {MAX_MESSAGE_LEN} characters"
        )));
    }
    if let Some(meta) = metadata {
        if meta.len() > MAX_METADATA_BYTES {
            return Err(EngineError::validation(format!(
                "event metadata exceeds {MAX_METADATA_BYTES} bytes"
            )));
        }
        if serde_json::from_str::<serde_json::Value>(meta).is_err() {
            return Err(EngineError::validation("event metadata is not valid JSON"));
        }
    }
    Ok(())
}

/// Insert an event, resolving the project: the task's project when a task is
/// supplied and carries one, else the agent's focus project, else NULL.
pub(crate) fn insert_resolved(
    tx: &Transaction<'_>,
    agent: &str,
    kind: EventKind,
    task_id: Option<&str>,
    message: &str,
    metadata: Option<&str>,
) -> EngineResult<Event> {
    let project = resolve_project(tx, agent, task_id)?;
    insert_direct(tx, agent, kind, project.as_deref(), task_id, message, metadata)
}

/// Insert an event with an explicit project id, bypassing resolution. Used
/// by ingest paths and by emitters that must never inherit focus.
pub(crate) fn insert_direct(
    tx: &Transaction<'_>,
    agent: &str,
    kind: EventKind,
    project_id: Option<&str>,
    task_id: Option<&str>,
    message: &str,
    metadata: Option<&str>,
) -> EngineResult<Event> {
    validate(agent, message, metadata)?;
    let created_at = types::now();
    tx.execute(
        "INSERT INTO events (kind, agent_name, project_id, task_id, message, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            kind.as_str(),
            agent.trim(),
            project_id,
            task_id,
            message.trim(),
            metadata,
            types::to_db_time(created_at),
        ],
    )?;
    let id = tx.last_insert_rowid();
    Ok(Event {
        id,
        kind,
        agent_name: agent.trim().to_string(),
        project_id: project_id.map(str::to_string),
        task_id: task_id.map(str::to_string),
        message: message.trim().to_string(),
        metadata: metadata.map(str::to_string),
        created_at,
        archived_at: None,
    })
}

fn resolve_project(
    tx: &Transaction<'_>,
    agent: &str,
    task_id: Option<&str>,
) -> EngineResult<Option<String>> {
    use rusqlite::OptionalExtension;

    if let Some(task) = task_id {
        let project: Option<Option<String>> = tx
            .query_row(
                "SELECT project_id FROM tasks WHERE id = ?1",
                rusqlite::params![task],
                |row| row.get(0),
            )
            .optional()?;
        // A missing task contributes nothing; the agent's focus still applies.
        if let Some(Some(project)) = project {
            return Ok(Some(project));
        }
    }
    let focus: Option<Option<String>> = tx
        .query_row(
            "SELECT focus_project_id FROM agent_state WHERE agent_name = ?1",
            rusqlite::params![agent.trim()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(focus.flatten())
}

pub(crate) fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let kind_raw: String = row.get(1)?;
    let created_raw: String = row.get(7)?;
    let archived_raw: Option<String> = row.get(8)?;
    Ok(Event {
        id: row.get(0)?,
        kind: EventKind::parse(&kind_raw).map_err(crate::store::row_error)?,
        agent_name: row.get(2)?,
        project_id: row.get(3)?,
        task_id: row.get(4)?,
        message: row.get(5)?,
        metadata: row.get(6)?,
        created_at: types::from_db_time(&created_raw).map_err(crate::store::row_error)?,
        archived_at: archived_raw
            .map(|raw| types::from_db_time(&raw).map_err(crate::store::row_error))
            .transpose()?,
    })
}

pub(crate) const EVENT_COLUMNS: &str =
    "id, kind, agent_name, project_id, task_id, message, metadata, created_at, archived_at";

/// Non-archived events in project-plus-global scope with id greater than
/// `after_id`, ascending. The resume engine's delta feed.
pub(crate) fn deltas_since(
    conn: &Connection,
    project_id: Option<&str>,
    after_id: i64,
    limit: i64,
) -> EngineResult<Vec<Event>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE id > ?1 AND archived_at IS NULL
           AND (?2 IS NULL OR project_id = ?2 OR project_id IS NULL)
         ORDER BY id ASC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![after_id, project_id, limit], map_event)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

impl Store {
    /// Append an event, resolving the project from the task or the agent's
    /// focus project.
    pub async fn append_event(
        &self,
        agent: &str,
        kind: EventKind,
        task_id: Option<&str>,
        message: &str,
        metadata: Option<&str>,
    ) -> EngineResult<Event> {
        self.write_tx(|tx| insert_resolved(tx, agent, kind, task_id, message, metadata))
            .await
    }

    /// Append an event with an explicit project id, bypassing resolution.
    pub async fn append_event_in(
        &self,
        agent: &str,
        kind: EventKind,
        project_id: Option<&str>,
        task_id: Option<&str>,
        message: &str,
        metadata: Option<&str>,
    ) -> EngineResult<Event> {
        self.write_tx(|tx| insert_direct(tx, agent, kind, project_id, task_id, message, metadata))
            .await
    }

    /// Append an event that must carry a project and never inherits one from
    /// the agent's focus.
    pub async fn append_project_event(
        &self,
        agent: &str,
        kind: EventKind,
        project_id: &str,
        message: &str,
        metadata: Option<&str>,
    ) -> EngineResult<Event> {
        if project_id.trim().is_empty() {
            return Err(EngineError::validation(
                "project-scoped events require a project id",
            ));
        }
        self.append_event_in(agent, kind, Some(project_id), None, message, metadata)
            .await
    }

    /// List events matching the filter, ascending by id.
    pub async fn list_events(&self, filter: &EventFilter<'_>) -> EngineResult<Vec<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR task_id = ?2)
               AND (?3 IS NULL OR kind = ?3)
               AND (?4 IS NULL OR id > ?4)
               AND (?5 OR archived_at IS NULL)
             ORDER BY id ASC LIMIT ?6"
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![
                    filter.project_id,
                    filter.task_id,
                    filter.kind.map(|k| k.as_str()),
                    filter.since_id,
                    filter.include_archived,
                    filter.limit.unwrap_or(i64::MAX),
                ],
                map_event,
            )?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    /// Count non-archived events, optionally in strict project scope.
    pub async fn count_active_events(&self, project_id: Option<&str>) -> EngineResult<i64> {
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events
                 WHERE archived_at IS NULL AND (?1 IS NULL OR project_id = ?1)",
                rusqlite::params![project_id],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// Archive the inclusive id range and append one `events_summary` event
    /// capturing the window. Idempotent per `(agent, request)`.
    pub async fn archive_events(
        &self,
        agent: &str,
        request: &str,
        req: ArchiveRequest<'_>,
    ) -> EngineResult<ArchiveOutcome> {
        if req.from_id <= 0 || req.to_id <= 0 {
            return Err(EngineError::validation("archive ids must be positive"));
        }
        if req.from_id > req.to_id {
            return Err(EngineError::validation(
                "archive range start must not exceed its end",
            ));
        }
        if req.summary.trim().is_empty() {
            return Err(EngineError::validation("archive summary must not be empty"));
        }

        self.run_idempotent(agent, request, "archive_events", |tx| {
            let archived_count = tx.execute(
                "UPDATE events SET archived_at = ?1
                 WHERE id BETWEEN ?2 AND ?3 AND archived_at IS NULL
                   AND (?4 IS NULL OR project_id = ?4)
                   AND (?5 IS NULL OR task_id = ?5)",
                rusqlite::params![
                    types::to_db_time(types::now()),
                    req.from_id,
                    req.to_id,
                    req.project_id,
                    req.task_id,
                ],
            )? as i64;

            let metadata = serde_json::json!({
                "archived_from_id": req.from_id,
                "archived_to_id": req.to_id,
                "archived_count": archived_count,
            })
            .to_string();
            let summary = insert_direct(
                tx,
                agent,
                EventKind::EventsSummary,
                req.project_id,
                req.task_id,
                req.summary,
                Some(&metadata),
            )?;
            tracing::info!(
                agent,
                from = req.from_id,
                to = req.to_id,
                archived = archived_count,
                "archived event window"
            );
            Ok(ArchiveOutcome {
                summary_event_id: summary.id,
                archived_count,
            })
        })
        .await
    }

    /// Compute the inclusive id window of the oldest active events to
    /// archive while leaving the `keep_recent` most recent untouched.
    /// `(0, 0)` when there is nothing to archive. `project_id = None` scopes
    /// to the global (project-less) stream.
    pub async fn archive_window(
        &self,
        project_id: Option<&str>,
        keep_recent: i64,
    ) -> EngineResult<(i64, i64)> {
        if keep_recent < 0 {
            return Err(EngineError::validation("keep_recent must not be negative"));
        }
        self.read(|conn| {
            let scope = match project_id {
                Some(_) => "project_id = ?1",
                None => "?1 IS NULL AND project_id IS NULL",
            };
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM events WHERE archived_at IS NULL AND {scope}"),
                rusqlite::params![project_id],
                |row| row.get(0),
            )?;
            if total <= keep_recent {
                return Ok((0, 0));
            }
            let (from_id, to_id): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT MIN(id), MAX(id) FROM (
                        SELECT id FROM events WHERE archived_at IS NULL AND {scope}
                        ORDER BY id ASC LIMIT ?2
                     )"
                ),
                rusqlite::params![project_id, total - keep_recent],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((from_id, to_id))
        })
        .await
    }

    // ── Typed emitters for the remaining closed kinds ─────────────────

    /// Record a run summary for a project.
    pub async fn record_run_summary(
        &self,
        agent: &str,
        project_id: Option<&str>,
        summary: &str,
        tasks_completed: i64,
        tasks_blocked: i64,
    ) -> EngineResult<Event> {
        let metadata = serde_json::json!({
            "tasks_completed": tasks_completed,
            "tasks_blocked": tasks_blocked,
        })
        .to_string();
        self.append_event_in(
            agent,
            EventKind::RunCompleted,
            project_id,
            None,
            summary,
            Some(&metadata),
        )
        .await
    }

    /// Record a user prompt. The project also lands in the metadata so
    /// prompt history can match prompts ingested before the project row
    /// existed.
    pub async fn record_user_prompt(
        &self,
        agent: &str,
        project_id: Option<&str>,
        task_id: Option<&str>,
        prompt: &str,
    ) -> EngineResult<Event> {
        let metadata = serde_json::json!({ "project": project_id }).to_string();
        self.append_event_in(
            agent,
            EventKind::UserPrompt,
            project_id,
            task_id,
            prompt,
            Some(&metadata),
        )
        .await
    }

    /// Record a reasoning trace against a task.
    pub async fn record_reasoning(
        &self,
        agent: &str,
        task_id: Option<&str>,
        content: &str,
    ) -> EngineResult<Event> {
        self.append_event(agent, EventKind::Reasoning, task_id, content, None)
            .await
    }

    /// Record a tool failure.
    pub async fn record_tool_failure(
        &self,
        agent: &str,
        task_id: Option<&str>,
        tool: &str,
        error: &str,
    ) -> EngineResult<Event> {
        let metadata = serde_json::json!({ "tool": tool }).to_string();
        self.append_event(agent, EventKind::ToolFailure, task_id, error, Some(&metadata))
            .await
    }

    /// Record a progress note.
    pub async fn record_progress(
        &self,
        agent: &str,
        task_id: Option<&str>,
        message: &str,
    ) -> EngineResult<Event> {
        self.append_event(agent, EventKind::Progress, task_id, message, None)
            .await
    }

    /// Recent `user_prompt` events for a project, newest first. Matches
    /// either the event's project id or the `project` field of its metadata.
    pub async fn user_prompt_history(
        &self,
        project_id: &str,
        limit: i64,
    ) -> EngineResult<Vec<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE kind = 'user_prompt'
               AND (project_id = ?1 OR json_extract(metadata, '$.project') = ?1)
             ORDER BY id DESC LIMIT ?2"
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![project_id, limit], map_event)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_list() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store
            .append_event("a", EventKind::Progress, None, "step one", None)
            .await
            .unwrap();
        let second = store
            .append_event("a", EventKind::Progress, None, "step two", None)
            .await
            .unwrap();
        assert!(second.id > first.id);

        let events = store.list_events(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "step one");
    }

    #[tokio::test]
    async fn validation_rejects_bad_input() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store
            .append_event("", EventKind::Progress, None, "m", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let err = store
            .append_event("a", EventKind::Progress, None, "   ", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let err = store
            .append_event("a", EventKind::Progress, None, "m", Some("{broken"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        let err = store
            .append_event("a", EventKind::Progress, None, &long, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn project_resolution_prefers_task_then_focus() {
        let store = Store::open_in_memory().await.unwrap();
        let task_project = store.create_project(None, "from-task", None).await.unwrap();
        let focus_project = store.create_project(None, "from-focus", None).await.unwrap();
        let task = store
            .create_task(crate::tasks::CreateTask {
                title: "t",
                description: "",
                priority: 0,
                project_id: Some(&task_project.id),
            })
            .await
            .unwrap();
        store
            .set_project_focus("a", Some(&focus_project.id))
            .await
            .unwrap();

        // With a task, the task's project wins.
        let event = store
            .append_event("a", EventKind::Progress, Some(&task.id), "working", None)
            .await
            .unwrap();
        assert_eq!(event.project_id.as_deref(), Some(task_project.id.as_str()));

        // Without a task, the agent's focus project applies.
        let event = store
            .append_event("a", EventKind::Progress, None, "musing", None)
            .await
            .unwrap();
        assert_eq!(event.project_id.as_deref(), Some(focus_project.id.as_str()));

        // The explicit variant bypasses both.
        let event = store
            .append_event_in("a", EventKind::Progress, None, Some(&task.id), "raw", None)
            .await
            .unwrap();
        assert!(event.project_id.is_none());

        // The project-demanding variant refuses an empty project.
        let err = store
            .append_project_event("a", EventKind::Progress, "  ", "m", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn archive_with_summary() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..10 {
            store
                .append_event("a", EventKind::Progress, None, &format!("e{i}"), None)
                .await
                .unwrap();
        }

        let outcome = store
            .archive_events(
                "a",
                "arch-1",
                ArchiveRequest {
                    project_id: None,
                    task_id: None,
                    from_id: 1,
                    to_id: 5,
                    summary: "first half",
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.archived_count, 5);
        assert_eq!(outcome.summary_event_id, 11);

        // 5 remaining + the summary event itself.
        assert_eq!(store.count_active_events(None).await.unwrap(), 6);

        let summary = store
            .list_events(&EventFilter {
                kind: Some(EventKind::EventsSummary),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.len(), 1);
        let meta = summary[0].metadata_json().unwrap();
        assert_eq!(meta["archived_count"], 5);

        // Replay returns the identical outcome without archiving more.
        let replay = store
            .archive_events(
                "a",
                "arch-1",
                ArchiveRequest {
                    project_id: None,
                    task_id: None,
                    from_id: 1,
                    to_id: 5,
                    summary: "first half",
                },
            )
            .await
            .unwrap();
        assert_eq!(replay, outcome);
        assert_eq!(store.count_active_events(None).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn archive_validation() {
        let store = Store::open_in_memory().await.unwrap();
        let bad = store
            .archive_events(
                "a",
                "r",
                ArchiveRequest {
                    project_id: None,
                    task_id: None,
                    from_id: 5,
                    to_id: 1,
                    summary: "s",
                },
            )
            .await
            .unwrap_err();
        assert_eq!(bad.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn archive_window_keeps_recent() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..8 {
            store
                .append_event("a", EventKind::Progress, None, &format!("e{i}"), None)
                .await
                .unwrap();
        }

        let (from, to) = store.archive_window(None, 3).await.unwrap();
        assert_eq!((from, to), (1, 5));

        // Nothing to archive once the scope fits inside keep_recent.
        let (from, to) = store.archive_window(None, 100).await.unwrap();
        assert_eq!((from, to), (0, 0));
    }

    #[tokio::test]
    async fn user_prompt_history_matches_metadata_project() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .record_user_prompt("a", Some("proj_1"), None, "do the thing")
            .await
            .unwrap();
        // Prompt with no project row, but project recorded in metadata.
        store
            .append_event_in(
                "a",
                EventKind::UserPrompt,
                None,
                None,
                "earlier prompt",
                Some(r#"{"project":"proj_1"}"#),
            )
            .await
            .unwrap();
        store
            .record_user_prompt("a", Some("proj_2"), None, "other project")
            .await
            .unwrap();

        let history = store.user_prompt_history("proj_1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "earlier prompt");
        assert_eq!(history[1].message, "do the thing");
    }
}
