/// Shared error type used across all Ambassador crates.
///
/// The HTTP layer maps each variant onto a status code and a generic
/// client-facing message. Variant payloads exist for server-side logs and
/// audit records; they are never echoed to clients.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ── Input ─────────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ── Authentication ────────────────────────────────────────────────
    #[error("unauthorized")]
    Unauthorized,

    #[error("session expired")]
    SessionExpired,

    // ── Authorization ─────────────────────────────────────────────────
    #[error("access denied")]
    Forbidden,

    #[error("kill switch engaged for {0}")]
    KillSwitch(String),

    // ── Resources ─────────────────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("per-user MCP pool exhausted")]
    PoolExhausted,

    #[error("per-user instance quota exceeded")]
    UserQuotaExceeded,

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("connection not ready: {0}")]
    ConnectionNotReady(String),

    #[error("reload already in progress")]
    ReloadConflict,

    #[error("audit backlog cannot absorb the event")]
    AuditBacklog,

    // ── Rate limiting ─────────────────────────────────────────────────
    #[error("rate limited: {0}")]
    RateLimited(String),

    // ── Profiles ──────────────────────────────────────────────────────
    #[error("profile inheritance cycle detected")]
    ProfileCycle,

    #[error("profile inheritance depth exceeded")]
    ProfileDepthExceeded,

    // ── Downstream MCPs ───────────────────────────────────────────────
    #[error("downstream timeout: {0}")]
    DownstreamTimeout(String),

    #[error("downstream MCP: {0}")]
    Downstream(String),

    // ── Infrastructure ────────────────────────────────────────────────
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
