//! Vybe: a multi-agent coordination and memory substrate.
//!
//! This crate re-exports the engine's public API. See [`vybe_engine`] for
//! the component documentation.

pub use vybe_engine::*;
