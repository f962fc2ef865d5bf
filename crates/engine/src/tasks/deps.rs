//! Task dependency edges: cycle-checked insertion, removal, and the
//! auto-block / auto-unblock transitions they drive.

use rusqlite::Connection;

use crate::store::Store;
use crate::types::{
    self, EngineError, EngineResult, TaskStatus, BLOCKED_REASON_DEPENDENCY,
};

use super::{cas_update, get_by_id};

/// Ids of tasks `task_id` depends on.
pub(crate) fn list_dependencies(conn: &Connection, task_id: &str) -> EngineResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_task_id FROM task_dependencies
         WHERE task_id = ?1 ORDER BY depends_on_task_id",
    )?;
    let rows = stmt.query_map(rusqlite::params![task_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Number of dependencies of `task_id` whose target is not completed.
pub(crate) fn unresolved_count(conn: &Connection, task_id: &str) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM task_dependencies d
         JOIN tasks t ON t.id = d.depends_on_task_id
         WHERE d.task_id = ?1 AND t.status != 'completed'",
        rusqlite::params![task_id],
        |row| row.get(0),
    )?)
}

/// Whether `target` is reachable from `start` by walking dependency edges.
/// Used before insert: an edge `task -> depends_on` is a cycle iff `task`
/// is reachable from `depends_on`.
fn reaches(conn: &Connection, start: &str, target: &str) -> EngineResult<bool> {
    Ok(conn.query_row(
        "WITH RECURSIVE reach(id) AS (
             SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1
             UNION
             SELECT d.depends_on_task_id FROM task_dependencies d
             JOIN reach r ON d.task_id = r.id
         )
         SELECT EXISTS(SELECT 1 FROM reach WHERE id = ?2)",
        rusqlite::params![start, target],
        |row| row.get(0),
    )?)
}

impl Store {
    /// Add a dependency edge `task_id -> depends_on`. Rejects self-edges and
    /// anything that would close a cycle; idempotent when the edge already
    /// exists. A pending depender transitions to blocked with the
    /// `dependency` reason.
    pub async fn add_dependency(&self, task_id: &str, depends_on: &str) -> EngineResult<()> {
        if task_id == depends_on {
            return Err(EngineError::validation("a task cannot depend on itself"));
        }
        self.write_tx(|tx| {
            let task = get_by_id(tx, task_id)?;
            get_by_id(tx, depends_on)?;

            if reaches(tx, depends_on, task_id)? {
                return Err(EngineError::CycleDetected {
                    task_id: task_id.to_string(),
                    depends_on_task_id: depends_on.to_string(),
                });
            }

            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![task_id, depends_on, types::to_db_time(types::now())],
            )?;

            if task.status == TaskStatus::Pending && unresolved_count(tx, task_id)? > 0 {
                cas_update(
                    tx,
                    task_id,
                    task.version,
                    TaskStatus::Blocked,
                    Some(BLOCKED_REASON_DEPENDENCY),
                    false,
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Remove a dependency edge. A task blocked for dependency reasons goes
    /// back to pending once its last unresolved dependency disappears.
    pub async fn remove_dependency(&self, task_id: &str, depends_on: &str) -> EngineResult<()> {
        self.write_tx(|tx| {
            tx.execute(
                "DELETE FROM task_dependencies
                 WHERE task_id = ?1 AND depends_on_task_id = ?2",
                rusqlite::params![task_id, depends_on],
            )?;

            let task = get_by_id(tx, task_id)?;
            let dependency_blocked = task.status == TaskStatus::Blocked
                && task
                    .blocked_reason
                    .as_deref()
                    .map(|r| r == BLOCKED_REASON_DEPENDENCY)
                    .unwrap_or(false);
            if dependency_blocked && unresolved_count(tx, task_id)? == 0 {
                cas_update(tx, task_id, task.version, TaskStatus::Pending, None, false)?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::CreateTask;
    use crate::types::CloseOutcome;

    async fn make_task(store: &Store, title: &str) -> types::Task {
        store
            .create_task(CreateTask {
                title,
                description: "",
                priority: 0,
                project_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dependency_blocks_then_unblocks_on_completion() {
        let store = Store::open_in_memory().await.unwrap();
        let t1 = make_task(&store, "t1").await;
        let t2 = make_task(&store, "t2").await;

        store.add_dependency(&t2.id, &t1.id).await.unwrap();
        let blocked = store.get_task(&t2.id).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.blocked_reason.as_deref(), Some("dependency"));
        assert_eq!(blocked.depends_on, vec![t1.id.clone()]);

        store
            .close_task(
                "a",
                "r1",
                crate::tasks::CloseRequest {
                    task_id: &t1.id,
                    outcome: CloseOutcome::Completed,
                    summary: "done",
                    blocked_reason: None,
                    label: None,
                },
            )
            .await
            .unwrap();

        let unblocked = store.get_task(&t2.id).await.unwrap();
        assert_eq!(unblocked.status, TaskStatus::Pending);
        assert!(unblocked.blocked_reason.is_none());
    }

    #[tokio::test]
    async fn removal_unblocks_only_when_nothing_unresolved_remains() {
        let store = Store::open_in_memory().await.unwrap();
        let a = make_task(&store, "a").await;
        let b = make_task(&store, "b").await;
        let c = make_task(&store, "c").await;

        store.add_dependency(&c.id, &a.id).await.unwrap();
        store.add_dependency(&c.id, &b.id).await.unwrap();

        store.remove_dependency(&c.id, &a.id).await.unwrap();
        assert_eq!(
            store.get_task(&c.id).await.unwrap().status,
            TaskStatus::Blocked
        );

        store.remove_dependency(&c.id, &b.id).await.unwrap();
        let task = store.get_task(&c.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.blocked_reason.is_none());
    }

    #[tokio::test]
    async fn self_edges_and_cycles_are_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let a = make_task(&store, "a").await;
        let b = make_task(&store, "b").await;
        let c = make_task(&store, "c").await;

        let err = store.add_dependency(&a.id, &a.id).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        store.add_dependency(&b.id, &a.id).await.unwrap();
        store.add_dependency(&c.id, &b.id).await.unwrap();

        // a -> c would close the loop a <- b <- c.
        let err = store.add_dependency(&a.id, &c.id).await.unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");

        // Direct two-node cycle.
        let err = store.add_dependency(&a.id, &b.id).await.unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");
    }

    #[tokio::test]
    async fn add_is_idempotent_for_existing_edge() {
        let store = Store::open_in_memory().await.unwrap();
        let a = make_task(&store, "a").await;
        let b = make_task(&store, "b").await;

        store.add_dependency(&b.id, &a.id).await.unwrap();
        store.add_dependency(&b.id, &a.id).await.unwrap();

        let task = store.get_task(&b.id).await.unwrap();
        assert_eq!(task.depends_on.len(), 1);
    }

    #[tokio::test]
    async fn missing_endpoints_are_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let a = make_task(&store, "a").await;

        let err = store.add_dependency(&a.id, "task_ghost").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = store.add_dependency("task_ghost", &a.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn delete_task_reevaluates_dependents() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = make_task(&store, "dep").await;
        let waiting = make_task(&store, "waiting").await;
        store.add_dependency(&waiting.id, &dep.id).await.unwrap();
        assert_eq!(
            store.get_task(&waiting.id).await.unwrap().status,
            TaskStatus::Blocked
        );

        store.delete_task(&dep.id).await.unwrap();

        let task = store.get_task(&waiting.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.depends_on.is_empty());

        let err = store.get_task(&dep.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn added_dep_on_in_progress_task_does_not_block_it() {
        let store = Store::open_in_memory().await.unwrap();
        let running = make_task(&store, "running").await;
        let dep = make_task(&store, "dep").await;
        store.start_task("a", "r1", &running.id).await.unwrap();

        store.add_dependency(&running.id, &dep.id).await.unwrap();
        assert_eq!(
            store.get_task(&running.id).await.unwrap().status,
            TaskStatus::InProgress
        );
    }
}
