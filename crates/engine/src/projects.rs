//! Named scopes for tasks, events, and memory.

use rusqlite::Connection;

use crate::ident;
use crate::store::Store;
use crate::types::{self, EngineError, EngineResult, Project};

pub(crate) fn map_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let created_raw: String = row.get(3)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        metadata: row.get(2)?,
        created_at: types::from_db_time(&created_raw).map_err(crate::store::row_error)?,
    })
}

pub(crate) fn get_by_id(conn: &Connection, project_id: &str) -> EngineResult<Project> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT id, name, metadata, created_at FROM projects WHERE id = ?1",
        rusqlite::params![project_id],
        map_project,
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound {
        entity: "project",
        id: project_id.to_string(),
    })
}

impl Store {
    /// Create a project. The id is caller-assigned or generated with the
    /// `proj_` prefix.
    pub async fn create_project(
        &self,
        id: Option<&str>,
        name: &str,
        metadata: Option<&str>,
    ) -> EngineResult<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("project name must not be empty"));
        }
        if let Some(explicit) = id {
            if explicit.trim().is_empty() {
                return Err(EngineError::validation(
                    "an explicit project id must not be empty",
                ));
            }
        }
        self.write_tx(|tx| {
            let project_id = id
                .map(str::to_string)
                .unwrap_or_else(|| ident::generate("proj"));
            tx.execute(
                "INSERT INTO projects (id, name, metadata, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    project_id,
                    name,
                    metadata,
                    types::to_db_time(types::now()),
                ],
            )?;
            get_by_id(tx, &project_id)
        })
        .await
    }

    pub async fn get_project(&self, project_id: &str) -> EngineResult<Project> {
        self.read(|conn| get_by_id(conn, project_id)).await
    }

    /// All projects, newest first.
    pub async fn list_projects(&self) -> EngineResult<Vec<Project>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, metadata, created_at FROM projects
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map([], map_project)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_with_generated_and_explicit_ids() {
        let store = Store::open_in_memory().await.unwrap();
        let generated = store.create_project(None, "alpha", None).await.unwrap();
        assert!(generated.id.starts_with("proj_"));

        let explicit = store
            .create_project(Some("proj_custom"), "beta", Some(r#"{"team":"core"}"#))
            .await
            .unwrap();
        assert_eq!(explicit.id, "proj_custom");

        let loaded = store.get_project("proj_custom").await.unwrap();
        assert_eq!(loaded.name, "beta");
        assert_eq!(loaded.metadata.as_deref(), Some(r#"{"team":"core"}"#));

        let all = store.list_projects().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_explicit_id_fails() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_project(Some("proj_x"), "one", None)
            .await
            .unwrap();
        let err = store
            .create_project(Some("proj_x"), "two", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE");
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.get_project("proj_ghost").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
