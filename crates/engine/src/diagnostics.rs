//! Read-only consistency checks over the store.

use serde::{Deserialize, Serialize};

use crate::store::Store;
use crate::types::{self, EngineResult};

/// How old an untouched in-progress task must be before it is flagged.
const STALE_IN_PROGRESS_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Info,
    Warning,
}

/// One finding from a diagnostics pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
    pub suggested_action: String,
}

impl Store {
    /// Run all read-only consistency checks and return the findings.
    pub async fn diagnose(&self) -> EngineResult<Vec<Diagnostic>> {
        self.read(|conn| {
            let mut findings = Vec::new();
            let now = types::now();

            // STALE_FOCUS: focus pointing at a completed or missing task.
            {
                let mut stmt = conn.prepare(
                    "SELECT s.agent_name, s.focus_task_id, t.status
                     FROM agent_state s
                     LEFT JOIN tasks t ON t.id = s.focus_task_id
                     WHERE s.focus_task_id IS NOT NULL
                       AND (t.id IS NULL OR t.status = 'completed')",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (agent, task_id, status) = row?;
                    let what = match status {
                        Some(_) => "a completed task",
                        None => "a missing task",
                    };
                    findings.push(Diagnostic {
                        level: DiagnosticLevel::Warning,
                        code: "STALE_FOCUS".to_string(),
                        message: format!("agent {agent} focus points at {what} ({task_id})"),
                        suggested_action:
                            "resume will auto-advance focus on the next cycle".to_string(),
                    });
                }
            }

            // STALE_IN_PROGRESS: in-progress tasks untouched for too long.
            {
                let cutoff = types::to_db_time(
                    now - chrono::Duration::minutes(STALE_IN_PROGRESS_MINUTES),
                );
                let mut stmt = conn.prepare(
                    "SELECT id, claimed_by FROM tasks
                     WHERE status = 'in_progress' AND updated_at < ?1
                     ORDER BY updated_at ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                for row in rows {
                    let (task_id, owner) = row?;
                    findings.push(Diagnostic {
                        level: DiagnosticLevel::Warning,
                        code: "STALE_IN_PROGRESS".to_string(),
                        message: format!(
                            "task {task_id} has been in progress for over \
                             {STALE_IN_PROGRESS_MINUTES} minutes (owner: {})",
                            owner.as_deref().unwrap_or("none")
                        ),
                        suggested_action: "reset the task to pending or close it".to_string(),
                    });
                }
            }

            // CLAIM_EXPIRED: leases that lapsed while the claim fields are
            // still set.
            {
                let mut stmt = conn.prepare(
                    "SELECT id, claimed_by FROM tasks
                     WHERE claimed_by IS NOT NULL AND claim_expires_at < ?1
                     ORDER BY claim_expires_at ASC",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![types::to_db_time(now)],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )?;
                for row in rows {
                    let (task_id, owner) = row?;
                    findings.push(Diagnostic {
                        level: DiagnosticLevel::Warning,
                        code: "CLAIM_EXPIRED".to_string(),
                        message: format!("claim on task {task_id} by {owner} has expired"),
                        suggested_action:
                            "another agent may claim the task; the stale lease yields on contact"
                                .to_string(),
                    });
                }
            }

            // CLAIM_MISSING: an in-progress task nobody claims.
            {
                let mut stmt = conn.prepare(
                    "SELECT id FROM tasks
                     WHERE status = 'in_progress' AND claimed_by IS NULL
                     ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for row in rows {
                    let task_id = row?;
                    findings.push(Diagnostic {
                        level: DiagnosticLevel::Warning,
                        code: "CLAIM_MISSING".to_string(),
                        message: format!("task {task_id} is in progress but unclaimed"),
                        suggested_action: "claim the task or reset it to pending".to_string(),
                    });
                }
            }

            Ok(findings)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::CreateTask;
    use crate::types::FocusChange;

    #[tokio::test]
    async fn clean_store_has_no_findings() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.diagnose().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_focus_is_flagged() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .update_agent_state(
                "a",
                None,
                FocusChange::Set("task_gone".into()),
                FocusChange::Keep,
            )
            .await
            .unwrap();

        let findings = store.diagnose().await.unwrap();
        assert!(findings.iter().any(|d| d.code == "STALE_FOCUS"));
    }

    #[tokio::test]
    async fn stale_in_progress_and_expired_claim_are_flagged() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store
            .create_task(CreateTask {
                title: "t",
                ..Default::default()
            })
            .await
            .unwrap();
        store.start_task("a", "r1", &task.id).await.unwrap();

        store
            .write_tx(|tx| {
                tx.execute(
                    "UPDATE tasks SET updated_at = ?1, claim_expires_at = ?1 WHERE id = ?2",
                    rusqlite::params![
                        types::to_db_time(types::now() - chrono::Duration::hours(1)),
                        task.id,
                    ],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let findings = store.diagnose().await.unwrap();
        assert!(findings.iter().any(|d| d.code == "STALE_IN_PROGRESS"));
        assert!(findings.iter().any(|d| d.code == "CLAIM_EXPIRED"));
    }

    #[tokio::test]
    async fn unclaimed_in_progress_is_flagged() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store
            .create_task(CreateTask {
                title: "t",
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update_task_status("a", &task.id, crate::types::TaskStatus::InProgress, None, 1)
            .await
            .unwrap();

        let findings = store.diagnose().await.unwrap();
        assert!(findings.iter().any(|d| d.code == "CLAIM_MISSING"));
    }
}
