use std::sync::Arc;

use chrono::{DateTime, Utc};

use amb_audit::{AuditBuffer, MemorySink};
use amb_domain::config::Config;
use amb_mcp::{SharedMcpManager, ToolRouter, UserMcpPool};
use amb_sessions::lifecycle::SessionLockMap;
use amb_sessions::{
    EphemeralAuthProvider, MemoryRepository, SessionLifecycleManager,
};

use crate::kill_switch::KillSwitchTable;
use crate::pipeline::Pipeline;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core** — config, repository
/// - **Sessions** — auth provider, lifecycle manager, per-session locks
/// - **MCPs** — shared manager, per-user pool, tool router
/// - **AAA** — pipeline, kill switches, audit buffer + query sink
/// - **Security (startup-computed)** — admin token digest
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub repo: Arc<MemoryRepository>,

    // ── Sessions ──────────────────────────────────────────────────────
    pub auth: Arc<EphemeralAuthProvider>,
    pub lifecycle: Arc<SessionLifecycleManager>,
    pub session_locks: Arc<SessionLockMap>,

    // ── MCPs ──────────────────────────────────────────────────────────
    pub shared_mcps: Arc<SharedMcpManager>,
    pub user_pool: Arc<UserMcpPool>,
    pub tool_router: Arc<ToolRouter>,

    // ── AAA ───────────────────────────────────────────────────────────
    pub pipeline: Arc<Pipeline>,
    pub kill_switches: Arc<KillSwitchTable>,
    pub audit: Arc<AuditBuffer>,
    /// Flushed events retained for the admin query endpoint.
    pub audit_log: Arc<MemorySink>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 of the admin bearer token. `None` disables the admin API.
    pub admin_token_hash: Option<Vec<u8>>,

    pub started_at: DateTime<Utc>,
}
