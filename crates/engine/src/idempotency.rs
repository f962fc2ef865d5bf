//! At-most-once execution ledger keyed by `(agent_name, request_id)`.
//!
//! The begin step claims the key or classifies the existing row; the
//! complete step stores the serialized result. Both steps share the caller's
//! transaction: an empty `result_json` can only be observed by another
//! worker mid-transaction (or after a crash), which is exactly the
//! contention the in-progress sentinel reports.

use rusqlite::Transaction;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::Store;
use crate::types::{self, EngineError, EngineResult};

/// What the begin step found for the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The key was claimed; run the closure and complete.
    Fresh,
    /// The key already completed; the stored result replays verbatim.
    Replay(String),
}

/// Claim `(agent, request)` for `command`, or classify the existing row.
pub(crate) fn begin(
    tx: &Transaction<'_>,
    agent: &str,
    request: &str,
    command: &str,
) -> EngineResult<BeginOutcome> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO idempotency (agent_name, request_id, command, result_json, created_at)
         VALUES (?1, ?2, ?3, '', ?4)",
        rusqlite::params![agent, request, command, types::to_db_time(types::now())],
    )?;
    if inserted == 1 {
        return Ok(BeginOutcome::Fresh);
    }

    let (stored_command, result_json): (String, String) = tx.query_row(
        "SELECT command, result_json FROM idempotency
         WHERE agent_name = ?1 AND request_id = ?2",
        rusqlite::params![agent, request],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if stored_command != command {
        return Err(EngineError::IdempotencyCollision {
            agent_name: agent.to_string(),
            request_id: request.to_string(),
            stored_command,
            requested_command: command.to_string(),
        });
    }
    if result_json.is_empty() {
        return Err(EngineError::IdempotencyInProgress {
            agent_name: agent.to_string(),
            request_id: request.to_string(),
        });
    }
    Ok(BeginOutcome::Replay(result_json))
}

/// Store the closure result for the key. An empty result is forbidden so
/// "in progress" stays distinguishable from "completed with empty result".
pub(crate) fn complete(
    tx: &Transaction<'_>,
    agent: &str,
    request: &str,
    result_json: &str,
) -> EngineResult<()> {
    if result_json.is_empty() {
        return Err(EngineError::validation(
            "idempotency completion requires a non-empty result",
        ));
    }
    let updated = tx.execute(
        "UPDATE idempotency SET result_json = ?1
         WHERE agent_name = ?2 AND request_id = ?3",
        rusqlite::params![result_json, agent, request],
    )?;
    if updated == 0 {
        return Err(EngineError::NotFound {
            entity: "idempotency key",
            id: format!("{agent}/{request}"),
        });
    }
    Ok(())
}

pub(crate) fn validate_key(agent: &str, request: &str, command: &str) -> EngineResult<()> {
    if agent.trim().is_empty() {
        return Err(EngineError::validation("agent name must not be empty"));
    }
    if request.trim().is_empty() {
        return Err(EngineError::validation("request id must not be empty"));
    }
    if command.trim().is_empty() {
        return Err(EngineError::validation("command must not be empty"));
    }
    Ok(())
}

impl Store {
    /// Execute `f` at most once for `(agent, request)`. A replayed call
    /// decodes and returns the stored result without re-running the closure.
    /// Begin, closure, and complete share one transaction; a transient
    /// failure rolls the whole attempt back and the retry kernel re-runs it.
    pub async fn run_idempotent<T, F>(
        &self,
        agent: &str,
        request: &str,
        command: &str,
        f: F,
    ) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Transaction<'_>) -> EngineResult<T>,
    {
        validate_key(agent, request, command)?;
        self.write_tx(|tx| match begin(tx, agent, request, command)? {
            BeginOutcome::Replay(stored) => {
                tracing::debug!(agent, request, command, "idempotent replay");
                Ok(serde_json::from_str(&stored)?)
            }
            BeginOutcome::Fresh => {
                let out = f(tx)?;
                let json = serde_json::to_string(&out)?;
                complete(tx, agent, request, &json)?;
                Ok(out)
            }
        })
        .await
    }

    /// Variant that re-runs the whole idempotent attempt up to `attempts`
    /// times when the caller classifies the error as retryable. Transient
    /// store contention is already absorbed by the retry kernel; this is for
    /// operation-level classifications on top of it.
    pub async fn run_idempotent_with_retry<T, F, P>(
        &self,
        agent: &str,
        request: &str,
        command: &str,
        attempts: u32,
        classify: P,
        f: F,
    ) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Transaction<'_>) -> EngineResult<T>,
        P: Fn(&EngineError) -> bool,
    {
        let mut last_attempt = 1u32;
        loop {
            match self.run_idempotent(agent, request, command, &f).await {
                Err(e) if last_attempt < attempts.max(1) && classify(&e) => {
                    tracing::debug!(
                        agent,
                        request,
                        attempt = last_attempt,
                        code = e.code(),
                        "caller-classified retry of idempotent operation"
                    );
                    last_attempt += 1;
                }
                other => return other,
            }
        }
    }
}
