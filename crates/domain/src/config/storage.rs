use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for gateway state (repository snapshot, HMAC secret, spill).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,

    /// Repository snapshot flush period.
    #[serde(default = "d_snapshot")]
    pub snapshot_interval_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
            snapshot_interval_seconds: d_snapshot(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_state_path() -> PathBuf {
    "./data".into()
}
fn d_snapshot() -> u64 {
    30
}
