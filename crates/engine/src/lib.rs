//! Vybe coordination and memory engine.
//!
//! A multi-agent coordination substrate backed by an embedded SQLite store:
//! a shared task graph with dependency-driven blocking and claim leases, an
//! append-only event log, scoped key/value memory with confidence and
//! supersession, file artifacts, and a deterministic resume algorithm that
//! assembles the agent brief packet. Every mutating operation can run
//! idempotently, keyed by `(agent_name, request_id)`.

pub mod agents;
pub mod artifacts;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod ident;
pub mod idempotency;
pub mod memory;
pub mod projects;
pub mod resume;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::{StoreConfig, DEFAULT_BUSY_TIMEOUT_MS, ENV_BUSY_TIMEOUT_MS};
pub use diagnostics::{Diagnostic, DiagnosticLevel};
pub use events::{ArchiveOutcome, ArchiveRequest, EventFilter};
pub use idempotency::BeginOutcome;
pub use memory::{
    canonical_key, CompactOutcome, CompactRequest, GcOutcome, MemoryUpsertOutcome, TouchOutcome,
    UpsertMemory,
};
pub use resume::{select_focus, BriefPacket, FocusContext, StatusCounts, TaskSnapshot};
pub use store::{RetryPolicy, Store, StoreStatus};
pub use tasks::{
    ClaimNextOutcome, CloseRequest, CloseResult, CreateTask, StartOutcome, TaskFilter,
};
pub use types::{
    AgentState, Artifact, CheckpointMode, CloseOutcome, EngineError, EngineResult, Event,
    EventKind, FocusChange, MemoryEntry, MemoryScope, Project, Task, TaskStatus, ValueType,
};
