use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-user MCP pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Admission caps and maintenance intervals for the per-user MCP pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Global ceiling on running per-user instances.
    #[serde(default = "d_max_total")]
    pub max_total_instances: usize,

    /// Per-user ceiling on running instances.
    #[serde(default = "d_max_per_user")]
    pub max_instances_per_user: usize,

    /// Instances idle longer than this are reaped.
    #[serde(default = "d_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Health-probe period.
    #[serde(default = "d_health")]
    pub health_interval_seconds: u64,

    /// Idle-reaper period.
    #[serde(default = "d_reap")]
    pub reap_interval_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total_instances: d_max_total(),
            max_instances_per_user: d_max_per_user(),
            idle_timeout_seconds: d_idle_timeout(),
            health_interval_seconds: d_health(),
            reap_interval_seconds: d_reap(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_total() -> usize {
    32
}
fn d_max_per_user() -> usize {
    4
}
fn d_idle_timeout() -> u64 {
    600
}
fn d_health() -> u64 {
    60
}
fn d_reap() -> u64 {
    60
}
