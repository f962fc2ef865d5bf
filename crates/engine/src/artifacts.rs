//! File-reference artifacts linked to a task and its creation event.

use crate::events;
use crate::ident;
use crate::store::Store;
use crate::types::{self, Artifact, EngineError, EngineResult, EventKind};

pub(crate) const ARTIFACT_COLUMNS: &str =
    "id, task_id, project_id, event_id, file_path, content_type, created_at";

pub(crate) fn map_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
    let created_raw: String = row.get(6)?;
    Ok(Artifact {
        id: row.get(0)?,
        task_id: row.get(1)?,
        project_id: row.get(2)?,
        event_id: row.get(3)?,
        file_path: row.get(4)?,
        content_type: row.get(5)?,
        created_at: types::from_db_time(&created_raw).map_err(crate::store::row_error)?,
    })
}

impl Store {
    /// Idempotently attach a file reference to a task. The project is
    /// resolved from the task; an `artifact_added` event is recorded in the
    /// same transaction and linked from the artifact row.
    pub async fn add_artifact(
        &self,
        agent: &str,
        request: &str,
        task_id: &str,
        file_path: &str,
        content_type: Option<&str>,
    ) -> EngineResult<Artifact> {
        if file_path.trim().is_empty() {
            return Err(EngineError::validation("artifact file path must not be empty"));
        }
        self.run_idempotent(agent, request, "add_artifact", |tx| {
            let task = crate::tasks::get_by_id(tx, task_id)?;
            let id = ident::generate("artifact");
            let metadata = serde_json::json!({
                "artifact_id": id,
                "file_path": file_path,
                "content_type": content_type,
            });
            let event = events::insert_resolved(
                tx,
                agent,
                EventKind::ArtifactAdded,
                Some(task_id),
                &format!("artifact {file_path} attached to task {task_id}"),
                Some(&metadata.to_string()),
            )?;
            let created_at = types::now();
            tx.execute(
                "INSERT INTO artifacts (id, task_id, project_id, event_id, file_path,
                                        content_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    task_id,
                    task.project_id,
                    event.id,
                    file_path,
                    content_type,
                    types::to_db_time(created_at),
                ],
            )?;
            Ok(Artifact {
                id,
                task_id: task_id.to_string(),
                project_id: task.project_id,
                event_id: event.id,
                file_path: file_path.to_string(),
                content_type: content_type.map(str::to_string),
                created_at,
            })
        })
        .await
    }

    /// Artifacts attached to a task, oldest first.
    pub async fn list_artifacts(&self, task_id: &str) -> EngineResult<Vec<Artifact>> {
        let sql = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts
             WHERE task_id = ?1 ORDER BY created_at ASC, id ASC"
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![task_id], map_artifact)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }
}
