use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle & registration limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session lifecycle parameters. All durations in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sliding TTL granted at registration and on each heartbeat.
    #[serde(default = "d_ttl")]
    pub ttl_seconds: u64,

    /// Hard ceiling: `expires_at` never passes `created_at` plus this.
    #[serde(default = "d_hard_max")]
    pub ttl_hard_max_seconds: u64,

    /// No activity for this long → `active` becomes `idle`.
    #[serde(default = "d_idle")]
    pub idle_timeout_seconds: u64,

    /// Additional quiet time after `idle` before the user pool spins down.
    #[serde(default = "d_spindown")]
    pub spindown_delay_seconds: u64,

    /// Expired rows older than this are deleted by the sweeper.
    #[serde(default = "d_retention")]
    pub retention_seconds: u64,

    /// Lifecycle evaluator tick period.
    #[serde(default = "d_evaluator")]
    pub evaluator_interval_seconds: u64,

    /// Sweeper tick period.
    #[serde(default = "d_sweeper")]
    pub sweeper_interval_seconds: u64,

    /// Minimum spacing between heartbeats per session. 0 disables.
    #[serde(default = "d_heartbeat_min")]
    pub heartbeat_min_interval_seconds: u64,

    /// Registration attempts allowed per source IP per minute.
    #[serde(default = "d_reg_minute")]
    pub register_per_minute: u32,

    /// Registration attempts allowed per source IP per hour.
    #[serde(default = "d_reg_hour")]
    pub register_per_hour: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: d_ttl(),
            ttl_hard_max_seconds: d_hard_max(),
            idle_timeout_seconds: d_idle(),
            spindown_delay_seconds: d_spindown(),
            retention_seconds: d_retention(),
            evaluator_interval_seconds: d_evaluator(),
            sweeper_interval_seconds: d_sweeper(),
            heartbeat_min_interval_seconds: d_heartbeat_min(),
            register_per_minute: d_reg_minute(),
            register_per_hour: d_reg_hour(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_ttl() -> u64 {
    3_600
}
fn d_hard_max() -> u64 {
    86_400
}
fn d_idle() -> u64 {
    900
}
fn d_spindown() -> u64 {
    300
}
fn d_retention() -> u64 {
    604_800
}
fn d_evaluator() -> u64 {
    60
}
fn d_sweeper() -> u64 {
    900
}
fn d_heartbeat_min() -> u64 {
    5
}
fn d_reg_minute() -> u32 {
    10
}
fn d_reg_hour() -> u32 {
    100
}
