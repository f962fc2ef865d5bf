//! Task lifecycle: creation, CAS status updates, claim leases, and the
//! composite start / claim-next / close / delete operations.

use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};

use crate::agents;
use crate::events;
use crate::ident;
use crate::store::Store;
use crate::types::{
    self, EngineError, EngineResult, EventKind, FocusChange, Task, TaskStatus,
    BLOCKED_REASON_DEPENDENCY, DEFAULT_CLAIM_TTL_MINUTES, MAX_CLAIM_TTL_MINUTES,
};

pub mod deps;

/// Inputs for [`Store::create_task`].
#[derive(Debug, Clone, Default)]
pub struct CreateTask<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub priority: i64,
    pub project_id: Option<&'a str>,
}

/// Filter for [`Store::list_tasks`]. A set priority matches exactly.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter<'a> {
    pub status: Option<TaskStatus>,
    pub project_id: Option<&'a str>,
    pub priority: Option<i64>,
}

/// Inputs for [`Store::close_task`].
#[derive(Debug, Clone)]
pub struct CloseRequest<'a> {
    pub task_id: &'a str,
    pub outcome: types::CloseOutcome,
    pub summary: &'a str,
    /// Persisted verbatim on a blocked close (e.g. `failure:api_timeout`).
    /// Empty or absent clears any stale reason.
    pub blocked_reason: Option<&'a str>,
    pub label: Option<&'a str>,
}

/// Result of an idempotent start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOutcome {
    /// Zero when the task was already in progress.
    pub status_event_id: i64,
    pub focus_event_id: i64,
}

/// Result of an idempotent claim-next. An empty `task_id` means no work was
/// available.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimNextOutcome {
    pub task_id: String,
    pub status_event_id: i64,
    pub focus_event_id: i64,
    pub claim_event_id: i64,
}

/// Result of an idempotent close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseResult {
    pub status_event_id: i64,
    pub close_event_id: i64,
    /// Dependents that went back to pending because this close resolved
    /// their last unresolved dependency.
    pub unblocked: Vec<String>,
}

pub(crate) const TASK_COLUMNS: &str = "id, title, description, status, priority, project_id, \
     blocked_reason, claimed_by, claimed_at, claim_expires_at, version, created_at, updated_at";

pub(crate) fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(3)?;
    let claimed_raw: Option<String> = row.get(8)?;
    let expires_raw: Option<String> = row.get(9)?;
    let created_raw: String = row.get(11)?;
    let updated_raw: String = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TaskStatus::parse(&status_raw).map_err(crate::store::row_error)?,
        priority: row.get(4)?,
        project_id: row.get(5)?,
        blocked_reason: row.get(6)?,
        claimed_by: row.get(7)?,
        claimed_at: claimed_raw
            .map(|raw| types::from_db_time(&raw).map_err(crate::store::row_error))
            .transpose()?,
        claim_expires_at: expires_raw
            .map(|raw| types::from_db_time(&raw).map_err(crate::store::row_error))
            .transpose()?,
        version: row.get(10)?,
        created_at: types::from_db_time(&created_raw).map_err(crate::store::row_error)?,
        updated_at: types::from_db_time(&updated_raw).map_err(crate::store::row_error)?,
        depends_on: Vec::new(),
    })
}

pub(crate) fn get_by_id(conn: &Connection, task_id: &str) -> EngineResult<Task> {
    use rusqlite::OptionalExtension;
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, rusqlite::params![task_id], map_task)
        .optional()?
        .ok_or_else(|| EngineError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })
}

/// Compare-and-swap the task row on its version counter. Zero rows affected
/// means another writer got there first.
pub(crate) fn cas_update(
    tx: &Transaction<'_>,
    task_id: &str,
    expected_version: i64,
    status: TaskStatus,
    blocked_reason: Option<&str>,
    release_claim: bool,
) -> EngineResult<()> {
    let sql = if release_claim {
        "UPDATE tasks SET status = ?1, blocked_reason = ?2, updated_at = ?3,
                          version = version + 1,
                          claimed_by = NULL, claimed_at = NULL, claim_expires_at = NULL
         WHERE id = ?4 AND version = ?5"
    } else {
        "UPDATE tasks SET status = ?1, blocked_reason = ?2, updated_at = ?3,
                          version = version + 1
         WHERE id = ?4 AND version = ?5"
    };
    let updated = tx.execute(
        sql,
        rusqlite::params![
            status.as_str(),
            blocked_reason,
            types::to_db_time(types::now()),
            task_id,
            expected_version,
        ],
    )?;
    if updated == 0 {
        return Err(EngineError::VersionConflict {
            entity: "task",
            id: task_id.to_string(),
            version: expected_version,
        });
    }
    Ok(())
}

pub(crate) fn emit_status_event(
    tx: &Transaction<'_>,
    agent: &str,
    task: &Task,
    to: TaskStatus,
    reason: Option<&str>,
) -> EngineResult<i64> {
    let metadata = serde_json::json!({
        "from": task.status.as_str(),
        "to": to.as_str(),
        "reason": reason,
    });
    let event = events::insert_resolved(
        tx,
        agent,
        EventKind::TaskStatus,
        Some(&task.id),
        &format!("task {}: {} -> {}", task.id, task.status, to),
        Some(&metadata.to_string()),
    )?;
    Ok(event.id)
}

fn claim_in_tx(
    tx: &Transaction<'_>,
    agent: &str,
    task_id: &str,
    ttl_minutes: i64,
) -> EngineResult<Task> {
    if ttl_minutes <= 0 {
        return Err(EngineError::validation("claim ttl must be positive"));
    }
    let ttl = ttl_minutes.min(MAX_CLAIM_TTL_MINUTES);
    let task = get_by_id(tx, task_id)?;
    let now = types::now();
    if !task.claimable_by(agent, now) {
        return Err(EngineError::ClaimContention {
            task_id: task_id.to_string(),
            current_owner: task.claimed_by.unwrap_or_default(),
            requested_by: agent.to_string(),
        });
    }
    tx.execute(
        "UPDATE tasks SET claimed_by = ?1, claimed_at = ?2, claim_expires_at = ?3, updated_at = ?2
         WHERE id = ?4",
        rusqlite::params![
            agent,
            types::to_db_time(now),
            types::to_db_time(now + chrono::Duration::minutes(ttl)),
            task_id,
        ],
    )?;
    get_by_id(tx, task_id)
}

fn set_focus_with_event(
    tx: &Transaction<'_>,
    agent: &str,
    task: &Task,
) -> EngineResult<i64> {
    agents::ensure(tx, agent)?;
    agents::update_state(tx, agent, None, FocusChange::Set(task.id.clone()), FocusChange::Keep)?;
    let metadata = serde_json::json!({ "task_id": task.id });
    let event = events::insert_resolved(
        tx,
        agent,
        EventKind::AgentFocus,
        Some(&task.id),
        &format!("agent {agent} focused task {}", task.id),
        Some(&metadata.to_string()),
    )?;
    Ok(event.id)
}

/// Dependents of `task_id` that are blocked for dependency reasons (or with
/// no recorded reason) and might unblock when it resolves.
fn unblock_candidates(conn: &Connection, task_id: &str) -> EngineResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT d.task_id FROM task_dependencies d
         JOIN tasks t ON t.id = d.task_id
         WHERE d.depends_on_task_id = ?1
           AND t.status = 'blocked'
           AND (t.blocked_reason = ?2 OR t.blocked_reason IS NULL OR t.blocked_reason = '')
         ORDER BY d.task_id",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![task_id, BLOCKED_REASON_DEPENDENCY],
        |row| row.get(0),
    )?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Move a dependency-blocked task back to pending if nothing unresolved
/// remains. Returns true when the transition happened.
fn unblock_if_clear(tx: &Transaction<'_>, task_id: &str) -> EngineResult<bool> {
    if deps::unresolved_count(tx, task_id)? > 0 {
        return Ok(false);
    }
    let task = get_by_id(tx, task_id)?;
    if task.status != TaskStatus::Blocked {
        return Ok(false);
    }
    cas_update(tx, task_id, task.version, TaskStatus::Pending, None, false)?;
    Ok(true)
}

impl Store {
    /// Create a pending task and return the full row.
    pub async fn create_task(&self, req: CreateTask<'_>) -> EngineResult<Task> {
        let title = req.title.trim();
        if title.is_empty() {
            return Err(EngineError::validation("task title must not be empty"));
        }
        self.write_tx(|tx| {
            if let Some(project) = req.project_id {
                crate::projects::get_by_id(tx, project)?;
            }
            let id = ident::generate("task");
            let now = types::to_db_time(types::now());
            tx.execute(
                "INSERT INTO tasks (id, title, description, status, priority, project_id,
                                    version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 1, ?6, ?6)",
                rusqlite::params![id, title, req.description, req.priority, req.project_id, now],
            )?;
            get_by_id(tx, &id)
        })
        .await
    }

    /// Fetch a task with its dependency list hydrated.
    pub async fn get_task(&self, task_id: &str) -> EngineResult<Task> {
        self.read(|conn| {
            let mut task = get_by_id(conn, task_id)?;
            task.depends_on = deps::list_dependencies(conn, task_id)?;
            Ok(task)
        })
        .await
    }

    /// List tasks, filtered by status / project / exact priority, ordered
    /// by priority descending then oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter<'_>) -> EngineResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR project_id = ?2)
               AND (?3 IS NULL OR priority = ?3)
             ORDER BY priority DESC, created_at ASC, id ASC"
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![
                    filter.status.map(|s| s.as_str()),
                    filter.project_id,
                    filter.priority,
                ],
                map_task,
            )?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    /// CAS status update that emits a `task_status` event in the same
    /// transaction. Surfaces `VERSION_CONFLICT` when the row moved.
    pub async fn update_task_status(
        &self,
        agent: &str,
        task_id: &str,
        status: TaskStatus,
        blocked_reason: Option<&str>,
        expected_version: i64,
    ) -> EngineResult<(Task, i64)> {
        self.write_tx(|tx| {
            let task = get_by_id(tx, task_id)?;
            if task.version != expected_version {
                return Err(EngineError::VersionConflict {
                    entity: "task",
                    id: task_id.to_string(),
                    version: expected_version,
                });
            }
            cas_update(tx, task_id, expected_version, status, blocked_reason, false)?;
            let event_id = emit_status_event(tx, agent, &task, status, blocked_reason)?;
            Ok((get_by_id(tx, task_id)?, event_id))
        })
        .await
    }

    /// Acquire (or re-enter, or take over an expired) claim lease on a task.
    pub async fn claim_task(
        &self,
        agent: &str,
        task_id: &str,
        ttl_minutes: i64,
    ) -> EngineResult<Task> {
        self.write_tx(|tx| claim_in_tx(tx, agent, task_id, ttl_minutes))
            .await
    }

    /// Idempotent start: move the task to in-progress, point the agent's
    /// focus at it, then claim it. The transaction rolls back as a whole if
    /// the claim fails, so focus never leaks.
    pub async fn start_task(
        &self,
        agent: &str,
        request: &str,
        task_id: &str,
    ) -> EngineResult<StartOutcome> {
        self.run_idempotent(agent, request, "start_task", |tx| {
            let task = get_by_id(tx, task_id)?;
            let status_event_id = if task.status != TaskStatus::InProgress {
                cas_update(tx, task_id, task.version, TaskStatus::InProgress, None, false)?;
                emit_status_event(tx, agent, &task, TaskStatus::InProgress, None)?
            } else {
                0
            };
            let focus_event_id = set_focus_with_event(tx, agent, &task)?;
            claim_in_tx(tx, agent, task_id, DEFAULT_CLAIM_TTL_MINUTES)?;
            Ok(StartOutcome {
                status_event_id,
                focus_event_id,
            })
        })
        .await
    }

    /// Idempotent claim-next: pick the best claimable pending task with no
    /// unresolved dependencies, start it, focus it, claim it, and record a
    /// `task_claimed` event. Returns an empty task id when no work is
    /// available.
    pub async fn claim_next_task(
        &self,
        agent: &str,
        request: &str,
        project_id: Option<&str>,
        ttl_minutes: i64,
    ) -> EngineResult<ClaimNextOutcome> {
        if ttl_minutes <= 0 {
            return Err(EngineError::validation("claim ttl must be positive"));
        }
        self.run_idempotent(agent, request, "claim_next_task", |tx| {
            use rusqlite::OptionalExtension;
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'pending'
                   AND (claimed_by IS NULL OR claimed_by = ?1 OR claim_expires_at < ?2)
                   AND (?3 IS NULL OR project_id = ?3)
                   AND NOT EXISTS (
                       SELECT 1 FROM task_dependencies d
                       JOIN tasks dt ON dt.id = d.depends_on_task_id
                       WHERE d.task_id = tasks.id AND dt.status != 'completed'
                   )
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1"
            );
            let candidate = tx
                .query_row(
                    &sql,
                    rusqlite::params![agent, types::to_db_time(types::now()), project_id],
                    map_task,
                )
                .optional()?;
            let Some(task) = candidate else {
                return Ok(ClaimNextOutcome::default());
            };

            cas_update(tx, &task.id, task.version, TaskStatus::InProgress, None, false)?;
            let status_event_id = emit_status_event(tx, agent, &task, TaskStatus::InProgress, None)?;
            let focus_event_id = set_focus_with_event(tx, agent, &task)?;
            claim_in_tx(tx, agent, &task.id, ttl_minutes)?;

            let metadata = serde_json::json!({ "ttl_minutes": ttl_minutes.min(MAX_CLAIM_TTL_MINUTES) });
            let claim_event = events::insert_resolved(
                tx,
                agent,
                EventKind::TaskClaimed,
                Some(&task.id),
                &format!("agent {agent} claimed task {}", task.id),
                Some(&metadata.to_string()),
            )?;
            tracing::info!(agent, task = %task.id, "claimed next task");

            Ok(ClaimNextOutcome {
                task_id: task.id.clone(),
                status_event_id,
                focus_event_id,
                claim_event_id: claim_event.id,
            })
        })
        .await
    }

    /// Idempotent close: set the outcome status, persist or clear the
    /// blocked reason, release the claim, and unblock dependents whose last
    /// unresolved dependency this completion resolved.
    pub async fn close_task(
        &self,
        agent: &str,
        request: &str,
        req: CloseRequest<'_>,
    ) -> EngineResult<CloseResult> {
        if req.summary.trim().is_empty() {
            return Err(EngineError::validation("close summary must not be empty"));
        }
        self.run_idempotent(agent, request, "close_task", |tx| {
            let task = get_by_id(tx, req.task_id)?;
            let reason = match req.outcome {
                types::CloseOutcome::Blocked => req.blocked_reason.filter(|r| !r.is_empty()),
                types::CloseOutcome::Completed => None,
            };
            cas_update(tx, req.task_id, task.version, req.outcome.status(), reason, true)?;
            let status_event_id = emit_status_event(tx, agent, &task, req.outcome.status(), reason)?;

            let metadata = serde_json::json!({
                "outcome": req.outcome.as_str(),
                "summary": req.summary,
                "label": req.label,
            });
            let close_event = events::insert_resolved(
                tx,
                agent,
                EventKind::RunCompleted,
                Some(&task.id),
                req.summary,
                Some(&metadata.to_string()),
            )?;

            let mut unblocked = Vec::new();
            if req.outcome == types::CloseOutcome::Completed {
                for dependent in unblock_candidates(tx, req.task_id)? {
                    if unblock_if_clear(tx, &dependent)? {
                        unblocked.push(dependent);
                    }
                }
            }
            tracing::info!(
                agent,
                task = req.task_id,
                outcome = req.outcome.as_str(),
                unblocked = unblocked.len(),
                "closed task"
            );
            Ok(CloseResult {
                status_event_id,
                close_event_id: close_event.id,
                unblocked,
            })
        })
        .await
    }

    /// Delete a task. Dependency edges cascade away; dependents that were
    /// blocked on it are re-evaluated and may return to pending.
    pub async fn delete_task(&self, task_id: &str) -> EngineResult<()> {
        self.write_tx(|tx| {
            get_by_id(tx, task_id)?;
            let candidates = unblock_candidates(tx, task_id)?;
            tx.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![task_id])?;
            for dependent in candidates {
                unblock_if_clear(tx, &dependent)?;
            }
            Ok(())
        })
        .await
    }

    /// Reset in-progress tasks that have not been touched within
    /// `max_age_minutes` back to pending, releasing their claims. The
    /// remediation suggested by the `STALE_IN_PROGRESS` diagnostic.
    pub async fn reset_stale_tasks(
        &self,
        agent: &str,
        max_age_minutes: i64,
    ) -> EngineResult<Vec<String>> {
        if max_age_minutes <= 0 {
            return Err(EngineError::validation("max age must be positive"));
        }
        self.write_tx(|tx| {
            let cutoff = types::to_db_time(types::now() - chrono::Duration::minutes(max_age_minutes));
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'in_progress' AND updated_at < ?1
                 ORDER BY updated_at ASC"
            );
            let stale: Vec<Task> = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![cutoff], map_task)?;
                rows.collect::<Result<_, _>>()?
            };
            let mut reset = Vec::with_capacity(stale.len());
            for task in stale {
                cas_update(tx, &task.id, task.version, TaskStatus::Pending, None, true)?;
                emit_status_event(tx, agent, &task, TaskStatus::Pending, None)?;
                reset.push(task.id);
            }
            Ok(reset)
        })
        .await
    }
}
