//! Deterministic resume: focus selection and brief-packet assembly.
//!
//! Focus selection is a pure rule set over prefetched snapshots, so the same
//! inputs always produce the same focus. The brief packet is the aggregated
//! context an agent needs to continue after interruption.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::agents;
use crate::artifacts::{map_artifact, ARTIFACT_COLUMNS};
use crate::events::{self, map_event, EVENT_COLUMNS};
use crate::memory::{map_memory, MEMORY_COLUMNS};
use crate::store::Store;
use crate::tasks::{get_by_id, map_task, deps, TASK_COLUMNS};
use crate::types::{
    self, Artifact, EngineResult, Event, EventKind, FocusChange, MemoryEntry, Project, Task,
    TaskStatus,
};

/// Memory quality gate: confidence floor and recency window.
const MEMORY_MIN_CONFIDENCE: f64 = 0.3;
const MEMORY_RECENCY_DAYS: i64 = 14;
const MEMORY_CAP: i64 = 50;
const RECENT_EVENT_CAP: i64 = 20;
const REASONING_CAP: i64 = 10;
const PIPELINE_CAP: i64 = 5;
const DELTA_CAP: i64 = 500;
const CANDIDATE_CAP: i64 = 100;

/// A task plus the dependency information focus selection needs.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task: Task,
    pub unresolved_deps: i64,
}

/// Inputs to [`select_focus`].
#[derive(Debug)]
pub struct FocusContext<'a> {
    pub agent_name: &'a str,
    pub now: DateTime<Utc>,
    pub project_id: Option<&'a str>,
    pub current: Option<&'a TaskSnapshot>,
    /// Events since the agent's cursor, ascending.
    pub deltas: &'a [Event],
    /// Snapshots for tasks referenced by `task_assigned` deltas.
    pub assigned: &'a HashMap<String, TaskSnapshot>,
    /// Claimable pending tasks with no unresolved deps, best first,
    /// already project-scoped when a scope was requested.
    pub candidates: &'a [Task],
}

/// Apply the focus rules in order and return the selected task id.
pub fn select_focus(ctx: &FocusContext<'_>) -> Option<String> {
    // Rule 1: an in-progress focus stays put.
    if let Some(current) = ctx.current {
        if current.task.status == TaskStatus::InProgress {
            return Some(current.task.id.clone());
        }
    }

    // Rule 2: a dependency-blocked focus (not a failure) with work still
    // outstanding stays put.
    if let Some(current) = ctx.current {
        if current.task.status == TaskStatus::Blocked
            && !current.task.blocked_on_failure()
            && current.unresolved_deps > 0
        {
            return Some(current.task.id.clone());
        }
    }

    // Rule 3: the first assignment delta pointing at a ready, claimable
    // task wins.
    for delta in ctx.deltas {
        if delta.kind != EventKind::TaskAssigned {
            continue;
        }
        let Some(task_id) = delta.task_id.as_deref() else {
            continue;
        };
        let Some(snapshot) = ctx.assigned.get(task_id) else {
            continue;
        };
        if snapshot.task.status != TaskStatus::Pending || snapshot.unresolved_deps > 0 {
            continue;
        }
        if !snapshot.task.claimable_by(ctx.agent_name, ctx.now) {
            continue;
        }
        if let Some(project) = ctx.project_id {
            if snapshot.task.project_id.as_deref() != Some(project) {
                continue;
            }
        }
        return Some(snapshot.task.id.clone());
    }

    // Rule 4: a focus that went back to pending stays put.
    if let Some(current) = ctx.current {
        if current.task.status == TaskStatus::Pending {
            return Some(current.task.id.clone());
        }
    }

    // Rule 5: best claimable pending task; the candidate list is already
    // ordered and scoped.
    if let Some(best) = ctx.candidates.first() {
        return Some(best.id.clone());
    }

    // Rule 6: nothing to do.
    None
}

/// Task counts per status in the requested scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub blocked: i64,
}

/// The aggregated resume context returned to an agent.
#[derive(Debug, Clone, Serialize)]
pub struct BriefPacket {
    pub agent_name: String,
    pub focus_task: Option<Task>,
    pub project: Option<Project>,
    /// Relevant memory: global + task + project scope, quality-filtered,
    /// best first, capped.
    pub memory: Vec<MemoryEntry>,
    /// Most recent non-archived events for the focus task, newest first.
    pub recent_events: Vec<Event>,
    pub artifacts: Vec<Artifact>,
    /// Latest reasoning traces in project-plus-global scope, newest first.
    pub reasoning: Vec<Event>,
    /// `ceil(total message characters / 4)` over the packet's events.
    pub token_estimate: u64,
    pub status_counts: StatusCounts,
    /// Next claimable pending tasks, excluding the focus.
    pub pipeline: Vec<Task>,
    /// Tasks whose only remaining unresolved dependency is the focus.
    pub unlocks: Vec<Task>,
}

fn snapshot(conn: &Connection, task_id: &str) -> EngineResult<Option<TaskSnapshot>> {
    match get_by_id(conn, task_id) {
        Ok(task) => {
            let unresolved_deps = deps::unresolved_count(conn, task_id)?;
            Ok(Some(TaskSnapshot {
                task,
                unresolved_deps,
            }))
        }
        Err(crate::types::EngineError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Claimable pending tasks with no unresolved dependencies, best first.
fn claimable_candidates(
    conn: &Connection,
    agent: &str,
    project_id: Option<&str>,
    exclude: Option<&str>,
    limit: i64,
) -> EngineResult<Vec<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = 'pending'
           AND (claimed_by IS NULL OR claimed_by = ?1 OR claim_expires_at < ?2)
           AND (?3 IS NULL OR project_id = ?3)
           AND (?4 IS NULL OR id != ?4)
           AND NOT EXISTS (
               SELECT 1 FROM task_dependencies d
               JOIN tasks dt ON dt.id = d.depends_on_task_id
               WHERE d.task_id = tasks.id AND dt.status != 'completed'
           )
         ORDER BY priority DESC, created_at ASC, id ASC
         LIMIT ?5"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params![
            agent,
            types::to_db_time(types::now()),
            project_id,
            exclude,
            limit,
        ],
        map_task,
    )?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn relevant_memory(
    conn: &Connection,
    focus_task: Option<&str>,
    project_id: Option<&str>,
) -> EngineResult<Vec<MemoryEntry>> {
    let now = types::now();
    let recency_floor = types::to_db_time(now - chrono::Duration::days(MEMORY_RECENCY_DAYS));
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memory
         WHERE superseded_by IS NULL
           AND (expires_at IS NULL OR expires_at > ?1)
           AND (scope = 'global'
                OR (scope = 'task' AND ?2 IS NOT NULL AND scope_id = ?2)
                OR (scope = 'project' AND (?3 IS NULL OR scope_id = ?3)))
           AND (confidence >= ?4 OR last_seen_at >= ?5)
         ORDER BY confidence DESC, last_seen_at DESC
         LIMIT ?6"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params![
            types::to_db_time(now),
            focus_task,
            project_id,
            MEMORY_MIN_CONFIDENCE,
            recency_floor,
            MEMORY_CAP,
        ],
        map_memory,
    )?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn status_counts(conn: &Connection, project_id: Option<&str>) -> EngineResult<StatusCounts> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM tasks
         WHERE (?1 IS NULL OR project_id = ?1)
         GROUP BY status",
    )?;
    let rows = stmt.query_map(rusqlite::params![project_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut counts = StatusCounts::default();
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "pending" => counts.pending = count,
            "in_progress" => counts.in_progress = count,
            "completed" => counts.completed = count,
            "blocked" => counts.blocked = count,
            _ => {}
        }
    }
    Ok(counts)
}

fn unlocks(conn: &Connection, focus_task: &str) -> EngineResult<Vec<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE id IN (
             SELECT d.task_id FROM task_dependencies d WHERE d.depends_on_task_id = ?1
         )
           AND EXISTS (SELECT 1 FROM tasks f WHERE f.id = ?1 AND f.status != 'completed')
           AND NOT EXISTS (
               SELECT 1 FROM task_dependencies d2
               JOIN tasks dt ON dt.id = d2.depends_on_task_id
               WHERE d2.task_id = tasks.id
                 AND dt.status != 'completed'
                 AND d2.depends_on_task_id != ?1
           )
         ORDER BY priority DESC, created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![focus_task], map_task)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn build_brief(
    conn: &Connection,
    agent: &str,
    focus_task_id: Option<&str>,
    project_id: Option<&str>,
) -> EngineResult<BriefPacket> {
    let focus_task = match focus_task_id {
        Some(id) => match get_by_id(conn, id) {
            Ok(mut task) => {
                task.depends_on = deps::list_dependencies(conn, id)?;
                Some(task)
            }
            Err(crate::types::EngineError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };

    // Best-effort project lookup.
    let project = match project_id {
        Some(id) => crate::projects::get_by_id(conn, id).ok(),
        None => None,
    };

    let memory = relevant_memory(conn, focus_task_id, project_id)?;

    let recent_events = match focus_task_id {
        Some(task_id) => {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE task_id = ?1 AND archived_at IS NULL
                 ORDER BY id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![task_id, RECENT_EVENT_CAP], map_event)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => Vec::new(),
    };

    let artifacts = match focus_task_id {
        Some(task_id) => {
            let sql = format!(
                "SELECT {ARTIFACT_COLUMNS} FROM artifacts
                 WHERE task_id = ?1 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![task_id], map_artifact)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => Vec::new(),
    };

    let reasoning = {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE kind = 'reasoning' AND archived_at IS NULL
               AND (?1 IS NULL OR project_id = ?1 OR project_id IS NULL)
             ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![project_id, REASONING_CAP], map_event)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let total_chars: usize = recent_events
        .iter()
        .chain(reasoning.iter())
        .map(|e| e.message.chars().count())
        .sum();
    let token_estimate = (total_chars as u64).div_ceil(4);

    let pipeline = claimable_candidates(conn, agent, project_id, focus_task_id, PIPELINE_CAP)?;
    let unlocks = match focus_task_id {
        Some(task_id) => unlocks(conn, task_id)?,
        None => Vec::new(),
    };

    Ok(BriefPacket {
        agent_name: agent.to_string(),
        focus_task,
        project,
        memory,
        recent_events,
        artifacts,
        reasoning,
        token_estimate,
        status_counts: status_counts(conn, project_id)?,
        pipeline,
        unlocks,
    })
}

impl Store {
    /// Apply the focus rules against the agent's cursor deltas and current
    /// state without persisting anything.
    pub async fn determine_focus(
        &self,
        agent: &str,
        current_task_id: Option<&str>,
        project_id: Option<&str>,
    ) -> EngineResult<Option<String>> {
        self.write_tx(|tx| {
            agents::ensure(tx, agent)?;
            let state = agents::get(tx, agent)?;
            let deltas =
                events::deltas_since(tx, project_id, state.last_seen_event_id, DELTA_CAP)?;
            let current = match current_task_id {
                Some(id) => snapshot(tx, id)?,
                None => None,
            };
            let mut assigned = HashMap::new();
            for delta in &deltas {
                if delta.kind != EventKind::TaskAssigned {
                    continue;
                }
                if let Some(task_id) = delta.task_id.as_deref() {
                    if !assigned.contains_key(task_id) {
                        if let Some(snap) = snapshot(tx, task_id)? {
                            assigned.insert(task_id.to_string(), snap);
                        }
                    }
                }
            }
            let candidates =
                claimable_candidates(tx, agent, project_id, None, CANDIDATE_CAP)?;
            Ok(select_focus(&FocusContext {
                agent_name: agent,
                now: types::now(),
                project_id,
                current: current.as_ref(),
                deltas: &deltas,
                assigned: &assigned,
                candidates: &candidates,
            }))
        })
        .await
    }

    /// Resume: select the agent's focus deterministically, persist the new
    /// focus and cursor, and assemble the brief packet for it.
    pub async fn resume(&self, agent: &str, project_id: Option<&str>) -> EngineResult<BriefPacket> {
        self.write_tx(|tx| {
            agents::ensure(tx, agent)?;
            let state = agents::get(tx, agent)?;
            let scope = project_id.or(state.focus_project_id.as_deref());

            let deltas = events::deltas_since(tx, scope, state.last_seen_event_id, DELTA_CAP)?;
            let current = match state.focus_task_id.as_deref() {
                Some(id) => snapshot(tx, id)?,
                None => None,
            };
            let mut assigned = HashMap::new();
            for delta in &deltas {
                if delta.kind != EventKind::TaskAssigned {
                    continue;
                }
                if let Some(task_id) = delta.task_id.as_deref() {
                    if !assigned.contains_key(task_id) {
                        if let Some(snap) = snapshot(tx, task_id)? {
                            assigned.insert(task_id.to_string(), snap);
                        }
                    }
                }
            }
            let candidates = claimable_candidates(tx, agent, scope, None, CANDIDATE_CAP)?;

            let focus = select_focus(&FocusContext {
                agent_name: agent,
                now: types::now(),
                project_id: scope,
                current: current.as_ref(),
                deltas: &deltas,
                assigned: &assigned,
                candidates: &candidates,
            });

            let cursor = deltas.last().map(|e| e.id);
            let focus_change = match &focus {
                Some(id) => FocusChange::Set(id.clone()),
                None => FocusChange::Clear,
            };
            agents::update_state(tx, agent, cursor, focus_change, FocusChange::Keep)?;
            tracing::debug!(
                agent,
                focus = focus.as_deref().unwrap_or(""),
                deltas = deltas.len(),
                "resume focus selected"
            );

            build_brief(tx, agent, focus.as_deref(), scope)
        })
        .await
    }

    /// Assemble a brief packet for an explicit focus without running focus
    /// selection or persisting state.
    pub async fn brief(
        &self,
        agent: &str,
        focus_task_id: Option<&str>,
        project_id: Option<&str>,
    ) -> EngineResult<BriefPacket> {
        self.read(|conn| build_brief(conn, agent, focus_task_id, project_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::CreateTask;

    fn plain_task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: 0,
            project_id: None,
            blocked_reason: None,
            claimed_by: None,
            claimed_at: None,
            claim_expires_at: None,
            version: 1,
            created_at: types::now(),
            updated_at: types::now(),
            depends_on: vec![],
        }
    }

    #[test]
    fn rule_1_keeps_in_progress_focus() {
        let current = TaskSnapshot {
            task: plain_task("task_a", TaskStatus::InProgress),
            unresolved_deps: 0,
        };
        let assigned = HashMap::new();
        let selected = select_focus(&FocusContext {
            agent_name: "x",
            now: types::now(),
            project_id: None,
            current: Some(&current),
            deltas: &[],
            assigned: &assigned,
            candidates: &[plain_task("task_b", TaskStatus::Pending)],
        });
        assert_eq!(selected.as_deref(), Some("task_a"));
    }

    #[test]
    fn rule_2_keeps_dependency_blocked_focus_but_not_failures() {
        let mut blocked = plain_task("task_a", TaskStatus::Blocked);
        blocked.blocked_reason = Some("dependency".into());
        let current = TaskSnapshot {
            task: blocked.clone(),
            unresolved_deps: 2,
        };
        let assigned = HashMap::new();
        let selected = select_focus(&FocusContext {
            agent_name: "x",
            now: types::now(),
            project_id: None,
            current: Some(&current),
            deltas: &[],
            assigned: &assigned,
            candidates: &[],
        });
        assert_eq!(selected.as_deref(), Some("task_a"));

        // A failure-blocked focus is abandoned.
        let mut failed = blocked;
        failed.blocked_reason = Some("failure:api_timeout".into());
        let current = TaskSnapshot {
            task: failed,
            unresolved_deps: 2,
        };
        let fallback = plain_task("task_b", TaskStatus::Pending);
        let selected = select_focus(&FocusContext {
            agent_name: "x",
            now: types::now(),
            project_id: None,
            current: Some(&current),
            deltas: &[],
            assigned: &assigned,
            candidates: std::slice::from_ref(&fallback),
        });
        assert_eq!(selected.as_deref(), Some("task_b"));
    }

    #[test]
    fn rule_3_takes_first_eligible_assignment() {
        let make_delta = |id: i64, task: &str| Event {
            id,
            kind: EventKind::TaskAssigned,
            agent_name: "planner".into(),
            project_id: None,
            task_id: Some(task.to_string()),
            message: "assigned".into(),
            metadata: None,
            created_at: types::now(),
            archived_at: None,
        };
        let deltas = vec![make_delta(1, "task_busy"), make_delta(2, "task_free")];

        let mut busy = plain_task("task_busy", TaskStatus::Pending);
        busy.claimed_by = Some("someone-else".into());
        busy.claim_expires_at = Some(types::now() + chrono::Duration::minutes(30));
        let free = plain_task("task_free", TaskStatus::Pending);

        let mut assigned = HashMap::new();
        assigned.insert(
            "task_busy".to_string(),
            TaskSnapshot {
                task: busy,
                unresolved_deps: 0,
            },
        );
        assigned.insert(
            "task_free".to_string(),
            TaskSnapshot {
                task: free,
                unresolved_deps: 0,
            },
        );

        let selected = select_focus(&FocusContext {
            agent_name: "x",
            now: types::now(),
            project_id: None,
            current: None,
            deltas: &deltas,
            assigned: &assigned,
            candidates: &[],
        });
        assert_eq!(selected.as_deref(), Some("task_free"));
    }

    #[test]
    fn rule_6_empty_when_nothing_applies() {
        let assigned = HashMap::new();
        let selected = select_focus(&FocusContext {
            agent_name: "x",
            now: types::now(),
            project_id: None,
            current: None,
            deltas: &[],
            assigned: &assigned,
            candidates: &[],
        });
        assert!(selected.is_none());
    }

    #[tokio::test]
    async fn determine_focus_prefers_priority_and_respects_claims() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store
            .create_task(CreateTask {
                title: "A",
                description: "",
                priority: 10,
                project_id: None,
            })
            .await
            .unwrap();
        let b = store
            .create_task(CreateTask {
                title: "B",
                description: "",
                priority: 5,
                project_id: None,
            })
            .await
            .unwrap();

        let focus = store.determine_focus("x", None, None).await.unwrap();
        assert_eq!(focus.as_deref(), Some(a.id.as_str()));

        store.claim_task("other_agent", &a.id, 60).await.unwrap();
        let focus = store.determine_focus("x", None, None).await.unwrap();
        assert_eq!(focus.as_deref(), Some(b.id.as_str()));
    }

    #[tokio::test]
    async fn resume_persists_focus_and_cursor() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store
            .create_task(CreateTask {
                title: "t",
                description: "",
                priority: 1,
                project_id: None,
            })
            .await
            .unwrap();
        store
            .append_event("someone", EventKind::Progress, None, "noise", None)
            .await
            .unwrap();

        let brief = store.resume("x", None).await.unwrap();
        assert_eq!(
            brief.focus_task.as_ref().map(|t| t.id.as_str()),
            Some(task.id.as_str())
        );
        assert_eq!(brief.status_counts.pending, 1);

        let state = store.agent_state("x").await.unwrap();
        assert_eq!(state.focus_task_id.as_deref(), Some(task.id.as_str()));
        assert!(state.last_seen_event_id > 0);
    }

    #[tokio::test]
    async fn brief_packet_contents() {
        let store = Store::open_in_memory().await.unwrap();
        let project = store.create_project(None, "p", None).await.unwrap();
        let task = store
            .create_task(CreateTask {
                title: "t",
                description: "",
                priority: 1,
                project_id: Some(&project.id),
            })
            .await
            .unwrap();
        let next = store
            .create_task(CreateTask {
                title: "next",
                description: "",
                priority: 0,
                project_id: Some(&project.id),
            })
            .await
            .unwrap();
        let waiting = store
            .create_task(CreateTask {
                title: "waiting",
                description: "",
                priority: 0,
                project_id: Some(&project.id),
            })
            .await
            .unwrap();
        store.add_dependency(&waiting.id, &task.id).await.unwrap();

        store.start_task("x", "r1", &task.id).await.unwrap();
        store
            .add_artifact("x", "r2", &task.id, "notes.md", None)
            .await
            .unwrap();
        store
            .record_reasoning("x", Some(&task.id), "thinking hard")
            .await
            .unwrap();
        store
            .upsert_memory(
                "x",
                "r3",
                crate::memory::UpsertMemory::new("fact", "42", crate::types::MemoryScope::Global, ""),
            )
            .await
            .unwrap();

        let brief = store
            .brief("x", Some(&task.id), Some(&project.id))
            .await
            .unwrap();
        assert_eq!(brief.project.as_ref().map(|p| p.id.as_str()), Some(project.id.as_str()));
        assert_eq!(brief.artifacts.len(), 1);
        assert_eq!(brief.reasoning.len(), 1);
        assert!(!brief.recent_events.is_empty());
        assert!(brief.token_estimate > 0);
        assert!(brief.memory.iter().any(|m| m.canonical_key == "fact"));

        // Pipeline excludes the focus and the blocked task.
        let pipeline_ids: Vec<&str> = brief.pipeline.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(pipeline_ids, vec![next.id.as_str()]);

        // Completing the focus would unlock the waiting task.
        let unlock_ids: Vec<&str> = brief.unlocks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(unlock_ids, vec![waiting.id.as_str()]);

        assert_eq!(brief.status_counts.in_progress, 1);
        assert_eq!(brief.status_counts.pending, 1);
        assert_eq!(brief.status_counts.blocked, 1);
    }

    #[tokio::test]
    async fn low_confidence_stale_memory_is_filtered() {
        let store = Store::open_in_memory().await.unwrap();
        let mut weak = crate::memory::UpsertMemory::new(
            "weak",
            "v",
            crate::types::MemoryScope::Global,
            "",
        );
        weak.confidence = Some(0.1);
        store.upsert_memory("x", "r1", weak).await.unwrap();

        // Fresh rows pass the recency arm even at low confidence.
        let brief = store.brief("x", None, None).await.unwrap();
        assert!(brief.memory.iter().any(|m| m.canonical_key == "weak"));

        // Age the row past the recency window; the confidence floor now
        // filters it.
        store
            .write_tx(|tx| {
                tx.execute(
                    "UPDATE memory SET last_seen_at = ?1 WHERE canonical_key = 'weak'",
                    rusqlite::params![types::to_db_time(
                        types::now() - chrono::Duration::days(MEMORY_RECENCY_DAYS + 1)
                    )],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let brief = store.brief("x", None, None).await.unwrap();
        assert!(!brief.memory.iter().any(|m| m.canonical_key == "weak"));
    }
}
