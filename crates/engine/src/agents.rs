//! Per-agent cursor and focus state.
//!
//! Rows are created lazily on first reference. Every mutation is a CAS on
//! the row version; the cursor only ever moves forward.

use rusqlite::{Connection, Transaction};

use crate::events;
use crate::store::Store;
use crate::types::{
    self, AgentState, EngineError, EngineResult, EventKind, FocusChange,
};

pub(crate) const AGENT_COLUMNS: &str =
    "agent_name, last_seen_event_id, focus_task_id, focus_project_id, version, last_active_at";

pub(crate) fn map_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentState> {
    let last_active_raw: String = row.get(5)?;
    Ok(AgentState {
        agent_name: row.get(0)?,
        last_seen_event_id: row.get(1)?,
        focus_task_id: row.get(2)?,
        focus_project_id: row.get(3)?,
        version: row.get(4)?,
        last_active_at: types::from_db_time(&last_active_raw).map_err(crate::store::row_error)?,
    })
}

/// Lazily create the agent row.
pub(crate) fn ensure(tx: &Transaction<'_>, agent: &str) -> EngineResult<()> {
    if agent.trim().is_empty() {
        return Err(EngineError::validation("agent name must not be empty"));
    }
    tx.execute(
        "INSERT OR IGNORE INTO agent_state (agent_name, last_seen_event_id, version, last_active_at)
         VALUES (?1, 0, 1, ?2)",
        rusqlite::params![agent.trim(), types::to_db_time(types::now())],
    )?;
    Ok(())
}

pub(crate) fn get(conn: &Connection, agent: &str) -> EngineResult<AgentState> {
    use rusqlite::OptionalExtension;
    let sql = format!("SELECT {AGENT_COLUMNS} FROM agent_state WHERE agent_name = ?1");
    conn.query_row(&sql, rusqlite::params![agent.trim()], map_agent)
        .optional()?
        .ok_or_else(|| EngineError::NotFound {
            entity: "agent state",
            id: agent.to_string(),
        })
}

/// Unified CAS update of cursor and focus. The cursor advance is monotonic
/// (`MAX(existing, new)`); each focus field is independently kept, cleared,
/// or set so callers never null a field they did not mean to change.
pub(crate) fn update_state(
    tx: &Transaction<'_>,
    agent: &str,
    cursor: Option<i64>,
    focus_task: FocusChange,
    focus_project: FocusChange,
) -> EngineResult<AgentState> {
    let state = get(tx, agent)?;
    let new_cursor = state.last_seen_event_id.max(cursor.unwrap_or(0));
    let new_task = match focus_task {
        FocusChange::Keep => state.focus_task_id.clone(),
        FocusChange::Clear => None,
        FocusChange::Set(id) => Some(id),
    };
    let new_project = match focus_project {
        FocusChange::Keep => state.focus_project_id.clone(),
        FocusChange::Clear => None,
        FocusChange::Set(id) => Some(id),
    };

    let updated = tx.execute(
        "UPDATE agent_state
         SET last_seen_event_id = ?1, focus_task_id = ?2, focus_project_id = ?3,
             version = version + 1, last_active_at = ?4
         WHERE agent_name = ?5 AND version = ?6",
        rusqlite::params![
            new_cursor,
            new_task,
            new_project,
            types::to_db_time(types::now()),
            agent.trim(),
            state.version,
        ],
    )?;
    if updated == 0 {
        return Err(EngineError::VersionConflict {
            entity: "agent_state",
            id: agent.to_string(),
            version: state.version,
        });
    }
    get(tx, agent)
}

impl Store {
    /// Fetch (lazily creating) the agent's state row.
    pub async fn agent_state(&self, agent: &str) -> EngineResult<AgentState> {
        self.write_tx(|tx| {
            ensure(tx, agent)?;
            get(tx, agent)
        })
        .await
    }

    /// Monotonically advance the agent's event cursor.
    pub async fn advance_cursor(&self, agent: &str, event_id: i64) -> EngineResult<AgentState> {
        self.update_agent_state(agent, Some(event_id), FocusChange::Keep, FocusChange::Keep)
            .await
    }

    /// Unified cursor + focus update. See [`FocusChange`] for the
    /// keep/clear/set convention on each focus field.
    pub async fn update_agent_state(
        &self,
        agent: &str,
        cursor: Option<i64>,
        focus_task: FocusChange,
        focus_project: FocusChange,
    ) -> EngineResult<AgentState> {
        self.write_tx(|tx| {
            ensure(tx, agent)?;
            update_state(tx, agent, cursor, focus_task.clone(), focus_project.clone())
        })
        .await
    }

    /// Point the agent's project focus (or clear it with `None`), emitting
    /// an `agent_project_focus` event that carries the project explicitly.
    pub async fn set_project_focus(
        &self,
        agent: &str,
        project_id: Option<&str>,
    ) -> EngineResult<(AgentState, i64)> {
        self.write_tx(|tx| {
            ensure(tx, agent)?;
            if let Some(project) = project_id {
                crate::projects::get_by_id(tx, project)?;
            }
            let change = match project_id {
                Some(p) => FocusChange::Set(p.to_string()),
                None => FocusChange::Clear,
            };
            let state = update_state(tx, agent, None, FocusChange::Keep, change)?;
            let metadata = serde_json::json!({ "project_id": project_id });
            let message = match project_id {
                Some(p) => format!("agent {agent} focused project {p}"),
                None => format!("agent {agent} cleared project focus"),
            };
            let event = events::insert_direct(
                tx,
                agent,
                EventKind::AgentProjectFocus,
                project_id,
                None,
                &message,
                Some(&metadata.to_string()),
            )?;
            Ok((state, event.id))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_creation() {
        let store = Store::open_in_memory().await.unwrap();
        let state = store.agent_state("a").await.unwrap();
        assert_eq!(state.agent_name, "a");
        assert_eq!(state.last_seen_event_id, 0);
        assert_eq!(state.version, 1);
        assert!(state.focus_task_id.is_none());
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let store = Store::open_in_memory().await.unwrap();
        store.agent_state("a").await.unwrap();

        let state = store.advance_cursor("a", 10).await.unwrap();
        assert_eq!(state.last_seen_event_id, 10);
        assert_eq!(state.version, 2);

        // A stale advance keeps the cursor but still bumps the version.
        let state = store.advance_cursor("a", 5).await.unwrap();
        assert_eq!(state.last_seen_event_id, 10);
        assert_eq!(state.version, 3);
    }

    #[tokio::test]
    async fn focus_matrix() {
        let store = Store::open_in_memory().await.unwrap();
        store.agent_state("a").await.unwrap();

        // Set both.
        let state = store
            .update_agent_state(
                "a",
                None,
                FocusChange::Set("task_1".into()),
                FocusChange::Set("proj_1".into()),
            )
            .await
            .unwrap();
        assert_eq!(state.focus_task_id.as_deref(), Some("task_1"));
        assert_eq!(state.focus_project_id.as_deref(), Some("proj_1"));

        // Task set, project untouched.
        let state = store
            .update_agent_state(
                "a",
                None,
                FocusChange::Set("task_2".into()),
                FocusChange::Keep,
            )
            .await
            .unwrap();
        assert_eq!(state.focus_task_id.as_deref(), Some("task_2"));
        assert_eq!(state.focus_project_id.as_deref(), Some("proj_1"));

        // Task set, project explicitly cleared.
        let state = store
            .update_agent_state(
                "a",
                None,
                FocusChange::Set("task_3".into()),
                FocusChange::Clear,
            )
            .await
            .unwrap();
        assert_eq!(state.focus_task_id.as_deref(), Some("task_3"));
        assert!(state.focus_project_id.is_none());

        // Project set, task cleared.
        let state = store
            .update_agent_state(
                "a",
                None,
                FocusChange::Clear,
                FocusChange::Set("proj_2".into()),
            )
            .await
            .unwrap();
        assert!(state.focus_task_id.is_none());
        assert_eq!(state.focus_project_id.as_deref(), Some("proj_2"));

        // Both cleared.
        let state = store
            .update_agent_state("a", None, FocusChange::Clear, FocusChange::Clear)
            .await
            .unwrap();
        assert!(state.focus_task_id.is_none());
        assert!(state.focus_project_id.is_none());

        // Neither supplied: only the cursor moves.
        let state = store
            .update_agent_state("a", Some(42), FocusChange::Keep, FocusChange::Keep)
            .await
            .unwrap();
        assert_eq!(state.last_seen_event_id, 42);
        assert!(state.focus_task_id.is_none());
    }

    #[tokio::test]
    async fn project_focus_emits_explicit_event() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_project(None, "demo", None)
            .await
            .map(|p| p.id)
            .unwrap();
        let projects = store.list_projects().await.unwrap();
        let project_id = projects[0].id.clone();

        let (state, event_id) = store
            .set_project_focus("a", Some(&project_id))
            .await
            .unwrap();
        assert_eq!(state.focus_project_id.as_deref(), Some(project_id.as_str()));

        let events = store
            .list_events(&crate::events::EventFilter {
                kind: Some(EventKind::AgentProjectFocus),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event_id);
        assert_eq!(events[0].project_id.as_deref(), Some(project_id.as_str()));

        let err = store
            .set_project_focus("a", Some("proj_ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn empty_agent_name_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.agent_state("  ").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }
}
