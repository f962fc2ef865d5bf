//! Error taxonomy for the coordination engine.
//!
//! Every error carries a stable surface code, a structured context map, and a
//! suggested action telling the caller what to try next. The retry kernel
//! consults [`EngineError::is_retryable`]; everything that is not busy/locked
//! or an idempotency in-progress sentinel is permanent.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Main engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("version conflict on {entity} {id}: expected version {version}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        version: i64,
    },

    #[error("task {task_id} is claimed by {current_owner}")]
    ClaimContention {
        task_id: String,
        current_owner: String,
        requested_by: String,
    },

    #[error("claim on task {task_id} is held by {current_owner}, not {requested_by}")]
    ClaimNotOwned {
        task_id: String,
        current_owner: String,
        requested_by: String,
    },

    #[error("request {request_id} for agent {agent_name} is still in progress")]
    IdempotencyInProgress {
        agent_name: String,
        request_id: String,
    },

    #[error(
        "request {request_id} for agent {agent_name} was recorded for command \
         {stored_command:?}, not {requested_command:?}"
    )]
    IdempotencyCollision {
        agent_name: String,
        request_id: String,
        stored_command: String,
        requested_command: String,
    },

    #[error("dependency cycle detected: {task_id} -> {depends_on_task_id}")]
    CycleDetected {
        task_id: String,
        depends_on_task_id: String,
    },

    #[error("schema version {current} does not match latest {latest}")]
    SchemaMismatch { current: i64, latest: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
        }
    }

    /// Stable surface code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "VALIDATION",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::VersionConflict { .. } => "VERSION_CONFLICT",
            EngineError::ClaimContention { .. } => "CLAIM_CONTENTION",
            EngineError::ClaimNotOwned { .. } => "CLAIM_NOT_OWNED",
            EngineError::IdempotencyInProgress { .. } => "IDEMPOTENCY_IN_PROGRESS",
            EngineError::IdempotencyCollision { .. } => "IDEMPOTENCY_COLLISION",
            EngineError::CycleDetected { .. } => "CYCLE_DETECTED",
            EngineError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            EngineError::Storage(e) if is_busy(e) => "BUSY",
            EngineError::Storage(_) => "STORAGE",
            EngineError::Serialization(_) => "SERIALIZATION",
            EngineError::Io(_) => "IO",
        }
    }

    /// Whether the retry kernel may re-run the operation. True only for the
    /// busy/locked class from the store and the idempotency in-progress
    /// sentinel.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::IdempotencyInProgress { .. } => true,
            EngineError::Storage(e) => is_busy(e),
            _ => false,
        }
    }

    /// Structured context map for the error, keyed by field name.
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        let mut put = |k: &str, v: &str| {
            map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        };
        match self {
            EngineError::NotFound { entity, id } => {
                put("entity", entity);
                put("id", id);
            }
            EngineError::VersionConflict {
                entity,
                id,
                version,
            } => {
                put("entity", entity);
                put("id", id);
                put("version", &version.to_string());
            }
            EngineError::ClaimContention {
                task_id,
                current_owner,
                requested_by,
            }
            | EngineError::ClaimNotOwned {
                task_id,
                current_owner,
                requested_by,
            } => {
                put("task_id", task_id);
                put("current_owner", current_owner);
                put("requested_by", requested_by);
            }
            EngineError::IdempotencyInProgress {
                agent_name,
                request_id,
            } => {
                put("agent", agent_name);
                put("request", request_id);
            }
            EngineError::IdempotencyCollision {
                agent_name,
                request_id,
                stored_command,
                requested_command,
            } => {
                put("agent", agent_name);
                put("request", request_id);
                put("command", stored_command);
                put("requested_command", requested_command);
            }
            EngineError::CycleDetected {
                task_id,
                depends_on_task_id,
            } => {
                put("task_id", task_id);
                put("depends_on_task_id", depends_on_task_id);
            }
            EngineError::SchemaMismatch { current, latest } => {
                put("current", &current.to_string());
                put("latest", &latest.to_string());
            }
            _ => {}
        }
        map
    }

    /// Human-readable next step for the caller.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "fix the invalid input and retry",
            EngineError::NotFound { .. } => "check the id, or create the record first",
            EngineError::VersionConflict { .. } => {
                "re-read the row and retry with a new request id"
            }
            EngineError::ClaimContention { .. } => {
                "pick another task, or wait for the claim lease to expire"
            }
            EngineError::ClaimNotOwned { .. } => "claim the task before operating on it",
            EngineError::IdempotencyInProgress { .. } => {
                "another worker holds this request id; retry shortly"
            }
            EngineError::IdempotencyCollision { .. } => "use a fresh request id per command",
            EngineError::CycleDetected { .. } => "remove the conflicting dependency edge",
            EngineError::SchemaMismatch { .. } => {
                "run migrations (open with auto-migrate) before using this store"
            }
            EngineError::Storage(e) if is_busy(e) => "the store is busy; the operation may be retried",
            _ => "inspect the underlying error",
        }
    }
}

/// Busy/locked classification for the underlying store error.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Unique-constraint classification (unique index or primary key).
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if ffi_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || ffi_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
