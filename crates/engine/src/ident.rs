//! Prefixed identifier generation for tasks, projects, and artifacts.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate an id of the form `<prefix>_<nanosecond_timestamp>_<12 hex>`,
/// combining monotonic wall-clock nanoseconds with 48 bits of cryptographic
/// randomness. Falls back to `<prefix>_<nanos>` if the OS random source
/// fails; the engine is single-process, so the timestamp alone is still
/// unique enough for the fallback path.
pub fn generate(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut entropy = [0u8; 6];
    match OsRng.try_fill_bytes(&mut entropy) {
        Ok(()) => {
            let hex: String = entropy.iter().map(|b| format!("{b:02x}")).collect();
            format!("{prefix}_{nanos}_{hex}")
        }
        Err(e) => {
            tracing::warn!(error = %e, "OS random source unavailable; using timestamp-only id");
            format!("{prefix}_{nanos}")
        }
    }
}
