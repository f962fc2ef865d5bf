//! Core data structures for the coordination and memory substrate.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{EngineError, EngineResult};

/// Blocked-reason literal for dependency-induced blocking.
pub const BLOCKED_REASON_DEPENDENCY: &str = "dependency";

/// Prefix for blocked reasons that record a failure cause (`failure:<cause>`).
pub const FAILURE_REASON_PREFIX: &str = "failure:";

/// Canonical key of the per-scope compaction summary row.
pub const MEMORY_SUMMARY_KEY: &str = "memory_summary";

/// Default confidence assigned to a freshly inserted memory entry.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Confidence bump applied when an upsert reinforces an existing value.
pub const REINFORCEMENT_BUMP: f64 = 0.05;

/// Default claim lease length in minutes.
pub const DEFAULT_CLAIM_TTL_MINUTES: i64 = 60;

/// Upper bound on claim lease length in minutes (24 hours).
pub const MAX_CLAIM_TTL_MINUTES: i64 = 1440;

// ── Timestamps ────────────────────────────────────────────────────────

/// Current UTC time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage. Fixed microsecond precision and a `Z`
/// suffix so TEXT comparison in SQL is chronological comparison.
pub fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn from_db_time(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::validation(format!("invalid stored timestamp {raw:?}: {e}")))
}

// ── Task lifecycle ────────────────────────────────────────────────────

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(EngineError::validation(format!(
                "invalid task status: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome accepted by a task close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    Completed,
    Blocked,
}

impl CloseOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            CloseOutcome::Completed => TaskStatus::Completed,
            CloseOutcome::Blocked => TaskStatus::Blocked,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.status().as_str()
    }
}

// ── Memory vocabulary ─────────────────────────────────────────────────

/// Memory scopes. `Global` forbids a scope id; the others require one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Global,
    Project,
    Task,
    Agent,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Global => "global",
            MemoryScope::Project => "project",
            MemoryScope::Task => "task",
            MemoryScope::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "global" => Ok(MemoryScope::Global),
            "project" => Ok(MemoryScope::Project),
            "task" => Ok(MemoryScope::Task),
            "agent" => Ok(MemoryScope::Agent),
            other => Err(EngineError::validation(format!(
                "invalid memory scope: {other:?}"
            ))),
        }
    }

    /// Validate the scope / scope-id pairing.
    pub fn check_scope_id(&self, scope_id: &str) -> EngineResult<()> {
        match self {
            MemoryScope::Global if !scope_id.is_empty() => Err(EngineError::validation(
                "global scope does not take a scope id",
            )),
            MemoryScope::Global => Ok(()),
            _ if scope_id.is_empty() => Err(EngineError::validation(format!(
                "scope {} requires a scope id",
                self.as_str()
            ))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Json,
    Array,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Json => "json",
            ValueType::Array => "array",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "string" => Ok(ValueType::String),
            "number" => Ok(ValueType::Number),
            "boolean" => Ok(ValueType::Boolean),
            "json" => Ok(ValueType::Json),
            "array" => Ok(ValueType::Array),
            other => Err(EngineError::validation(format!(
                "invalid value type: {other:?}"
            ))),
        }
    }

    /// Infer the value type of a raw input string: `true`/`false` is a
    /// boolean, a parseable float is a number, a parseable `{...}` object is
    /// json, a parseable `[...]` is an array, anything else is a string.
    pub fn infer(value: &str) -> ValueType {
        let trimmed = value.trim();
        if trimmed == "true" || trimmed == "false" {
            return ValueType::Boolean;
        }
        if trimmed.parse::<f64>().is_ok() {
            return ValueType::Number;
        }
        if trimmed.starts_with('{') {
            if let Ok(serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
                return ValueType::Json;
            }
        }
        if trimmed.starts_with('[') {
            if let Ok(serde_json::Value::Array(_)) = serde_json::from_str(trimmed) {
                return ValueType::Array;
            }
        }
        ValueType::String
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Event vocabulary ──────────────────────────────────────────────────

/// Closed vocabulary of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStatus,
    TaskAssigned,
    TaskClaimed,
    AgentFocus,
    AgentProjectFocus,
    MemoryUpserted,
    MemoryReinforced,
    MemoryTouched,
    MemoryCompacted,
    MemoryGc,
    MemoryDelete,
    ArtifactAdded,
    EventsSummary,
    RunCompleted,
    UserPrompt,
    Reasoning,
    ToolFailure,
    Progress,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStatus => "task_status",
            EventKind::TaskAssigned => "task_assigned",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::AgentFocus => "agent_focus",
            EventKind::AgentProjectFocus => "agent_project_focus",
            EventKind::MemoryUpserted => "memory_upserted",
            EventKind::MemoryReinforced => "memory_reinforced",
            EventKind::MemoryTouched => "memory_touched",
            EventKind::MemoryCompacted => "memory_compacted",
            EventKind::MemoryGc => "memory_gc",
            EventKind::MemoryDelete => "memory_delete",
            EventKind::ArtifactAdded => "artifact_added",
            EventKind::EventsSummary => "events_summary",
            EventKind::RunCompleted => "run_completed",
            EventKind::UserPrompt => "user_prompt",
            EventKind::Reasoning => "reasoning",
            EventKind::ToolFailure => "tool_failure",
            EventKind::Progress => "progress",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "task_status" => Ok(EventKind::TaskStatus),
            "task_assigned" => Ok(EventKind::TaskAssigned),
            "task_claimed" => Ok(EventKind::TaskClaimed),
            "agent_focus" => Ok(EventKind::AgentFocus),
            "agent_project_focus" => Ok(EventKind::AgentProjectFocus),
            "memory_upserted" => Ok(EventKind::MemoryUpserted),
            "memory_reinforced" => Ok(EventKind::MemoryReinforced),
            "memory_touched" => Ok(EventKind::MemoryTouched),
            "memory_compacted" => Ok(EventKind::MemoryCompacted),
            "memory_gc" => Ok(EventKind::MemoryGc),
            "memory_delete" => Ok(EventKind::MemoryDelete),
            "artifact_added" => Ok(EventKind::ArtifactAdded),
            "events_summary" => Ok(EventKind::EventsSummary),
            "run_completed" => Ok(EventKind::RunCompleted),
            "user_prompt" => Ok(EventKind::UserPrompt),
            "reasoning" => Ok(EventKind::Reasoning),
            "tool_failure" => Ok(EventKind::ToolFailure),
            "progress" => Ok(EventKind::Progress),
            other => Err(EngineError::validation(format!(
                "invalid event kind: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WAL checkpoint modes accepted by [`crate::store::Store::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Truncate,
    Restart,
}

impl CheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Truncate => "TRUNCATE",
            CheckpointMode::Restart => "RESTART",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PASSIVE" => Ok(CheckpointMode::Passive),
            "FULL" => Ok(CheckpointMode::Full),
            "TRUNCATE" => Ok(CheckpointMode::Truncate),
            "RESTART" => Ok(CheckpointMode::Restart),
            other => Err(EngineError::validation(format!(
                "invalid checkpoint mode: {other:?}"
            ))),
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────────────

/// Named scope for tasks, events, and memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A unit of work shared between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub project_id: Option<String>,
    pub blocked_reason: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ids of tasks this task depends on. Hydrated by `get_task`; empty on
    /// list paths.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Task {
    /// Whether the claim lease admits `agent` right now: unclaimed, held by
    /// the same agent, or expired.
    pub fn claimable_by(&self, agent: &str, at: DateTime<Utc>) -> bool {
        match &self.claimed_by {
            None => true,
            Some(owner) if owner == agent => true,
            Some(_) => self.claim_expires_at.map(|exp| exp < at).unwrap_or(true),
        }
    }

    /// Whether the blocked reason records a failure (`failure:<cause>`).
    pub fn blocked_on_failure(&self) -> bool {
        self.blocked_reason
            .as_deref()
            .map(|r| r.starts_with(FAILURE_REASON_PREFIX))
            .unwrap_or(false)
    }
}

/// Append-only log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub kind: EventKind,
    pub agent_name: String,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub message: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Decode the metadata blob, if any.
    pub fn metadata_json(&self) -> Option<serde_json::Value> {
        self.metadata
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
    }
}

/// Scoped key/value memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub key: String,
    pub canonical_key: String,
    pub value: String,
    pub value_type: ValueType,
    pub scope: MemoryScope,
    pub scope_id: String,
    pub confidence: f64,
    pub last_seen_at: DateTime<Utc>,
    pub source_event_id: Option<i64>,
    pub superseded_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// File reference linked to a task and its creation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    pub project_id: Option<String>,
    pub event_id: i64,
    pub file_path: String,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-agent cursor and focus record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_name: String,
    pub last_seen_event_id: i64,
    pub focus_task_id: Option<String>,
    pub focus_project_id: Option<String>,
    pub version: i64,
    pub last_active_at: DateTime<Utc>,
}

/// Three-way focus field update: leave untouched, clear, or set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FocusChange {
    #[default]
    Keep,
    Clear,
    Set(String),
}

impl FocusChange {
    /// Map the wire convention used by callers: `None` keeps the field,
    /// `Some("")` clears it, any other value sets it.
    pub fn from_option(value: Option<&str>) -> Self {
        match value {
            None => FocusChange::Keep,
            Some("") => FocusChange::Clear,
            Some(v) => FocusChange::Set(v.to_string()),
        }
    }
}
