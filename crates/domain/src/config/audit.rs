use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// In-memory ring capacity.
    #[serde(default = "d_ring")]
    pub ring_capacity: usize,

    /// Flusher period.
    #[serde(default = "d_flush_ms")]
    pub flush_interval_ms: u64,

    /// What happens to a request when emission cannot be absorbed.
    #[serde(default)]
    pub failure_mode: AuditFailureMode,

    /// Append-only overflow file. `None` disables spilling (overflow drops
    /// with a counter instead).
    #[serde(default)]
    pub spill_path: Option<PathBuf>,

    /// Spill file size cap in bytes.
    #[serde(default = "d_spill_max")]
    pub spill_max_bytes: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            ring_capacity: d_ring(),
            flush_interval_ms: d_flush_ms(),
            failure_mode: AuditFailureMode::default(),
            spill_path: None,
            spill_max_bytes: d_spill_max(),
        }
    }
}

/// `buffer` (default) never fails the user request; `block` fails it when
/// the ring is full and the spill path cannot absorb the event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditFailureMode {
    #[default]
    Buffer,
    Block,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_ring() -> usize {
    10_000
}
fn d_flush_ms() -> u64 {
    5_000
}
fn d_spill_max() -> u64 {
    100 * 1024 * 1024
}
