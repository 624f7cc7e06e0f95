//! Admin API endpoints. All are gated by [`AdminGuard`].
//!
//! Users, preshared keys, profiles, session control, kill switches, HMAC
//! rotation, and MCP catalog management live here. Plaintext keys appear in
//! exactly one response: the creation reply.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use amb_audit::{AuditEvent, EventType, Severity};
use amb_authz::{check_inheritance, ToolGlobSet};
use amb_domain::config::McpCatalogEntry;
use amb_domain::entity::{
    KeyStatus, PresharedKey, RateLimits, SessionStatus, TimeWindow, ToolProfile, User,
    UserStatus,
};
use amb_domain::error::Error;
use amb_mcp::DownstreamConnection;
use amb_sessions::repository::disconnect_session_connections;
use amb_sessions::token::random_secret;
use amb_sessions::SessionRepository;

use crate::api::auth::AdminGuard;
use crate::api::error::ApiError;
use crate::kill_switch::KillSwitchKind;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/admin/info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn system_info(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.repo.list_sessions().await?;
    let live = sessions.iter().filter(|s| s.status.is_live()).count();
    let (pool_total, _) = state.user_pool.counts().await;

    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "node_name": state.config.server.node_name,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "sessions": { "total": sessions.len(), "live": live },
        "shared_mcps": state.shared_mcps.server_count().await,
        "per_user_instances": pool_total,
        "audit": {
            "ring_len": state.audit.ring_len(),
            "dropped": state.audit.dropped_count(),
            "spilled": state.audit.spilled_count(),
        },
        "kill_switches": state.kill_switches.list().len(),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub display_name: String,
}

pub async fn create_user(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.display_name.trim().is_empty() {
        return Err(Error::InvalidRequest("display_name must not be empty".into()).into());
    }
    let user = User {
        user_id: Uuid::new_v4(),
        display_name: req.display_name,
        status: UserStatus::Active,
        auth_source: "admin".into(),
        created_at: Utc::now(),
    };
    state.repo.insert_user(user.clone()).await?;
    Ok(Json(serde_json::json!(user)))
}

pub async fn list_users(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(serde_json::json!({
        "users": state.repo.list_users().await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetUserStatusRequest {
    pub status: UserStatus,
}

/// Status changes cascade: a user losing `active` loses every live session
/// and their per-user pool with it.
pub async fn set_user_status(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SetUserStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.repo.set_user_status(user_id, req.status).await?;

    if req.status != UserStatus::Active {
        let now = Utc::now();
        let target = match req.status {
            UserStatus::Suspended => SessionStatus::Suspended,
            _ => SessionStatus::Expired,
        };
        for mut session in state.repo.live_sessions_for_user(user_id).await? {
            let session_id = session.session_id;
            session.status = target;
            state.repo.update_session(session).await?;
            disconnect_session_connections(state.repo.as_ref(), session_id, now).await?;
        }
        state.user_pool.terminate_for_user(user_id).await;
    }

    Ok(Json(serde_json::json!({ "user_id": user_id, "status": req.status })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UpsertProfileRequest {
    /// Present for updates; omitted to create.
    #[serde(default)]
    pub profile_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub environment_scope: Vec<String>,
    #[serde(default)]
    pub time_restrictions: Vec<TimeWindow>,
    #[serde(default)]
    pub inherited_from: Option<Uuid>,
}

pub async fn list_profiles(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(serde_json::json!({
        "profiles": state.repo.list_profiles().await?,
    })))
}

pub async fn upsert_profile(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<UpsertProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(Error::InvalidRequest("profile name must not be empty".into()).into());
    }
    // Globs must compile before the profile can decide anything.
    ToolGlobSet::compile(&req.allowed_tools)
        .map_err(|_| Error::InvalidRequest("invalid allowed_tools glob".into()))?;
    ToolGlobSet::compile(&req.denied_tools)
        .map_err(|_| Error::InvalidRequest("invalid denied_tools glob".into()))?;

    let profile_id = req.profile_id.unwrap_or_else(Uuid::new_v4);

    // Unique names across profiles.
    if let Some(existing) = state.repo.get_profile_by_name(&req.name).await? {
        if existing.profile_id != profile_id {
            return Err(Error::Conflict(format!("profile name {} taken", req.name)).into());
        }
    }

    // Inheritance is validated against the stored DAG before the write.
    let profiles: std::collections::HashMap<Uuid, ToolProfile> = state
        .repo
        .list_profiles()
        .await?
        .into_iter()
        .map(|p| (p.profile_id, p))
        .collect();
    if let Some(parent) = req.inherited_from {
        if profiles.get(&parent).is_none() {
            return Err(Error::NotFound(format!("profile {parent}")).into());
        }
    }
    check_inheritance(&profiles, profile_id, req.inherited_from)?;

    let profile = ToolProfile {
        profile_id,
        name: req.name,
        allowed_tools: req.allowed_tools,
        denied_tools: req.denied_tools,
        rate_limits: req.rate_limits,
        environment_scope: req.environment_scope,
        time_restrictions: req.time_restrictions,
        inherited_from: req.inherited_from,
    };
    state.repo.upsert_profile(profile.clone()).await?;

    state.pipeline.emit(
        AuditEvent::new(
            EventType::ProfileUpdated,
            Severity::Info,
            "upsert_profile",
            "admin",
        )
        .meta("profile", Value::String(profile.name.clone())),
    )?;

    Ok(Json(serde_json::json!(profile)))
}

pub async fn delete_profile(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.repo.delete_profile(profile_id).await?;
    Ok(Json(serde_json::json!({ "deleted": profile_id })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preshared keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub user_id: Uuid,
    pub profile_id: Uuid,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create_key(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .repo
        .get_user(req.user_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {}", req.user_id)))?;
    state
        .repo
        .get_profile(req.profile_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("profile {}", req.profile_id)))?;

    let generated = amb_sessions::keys::generate_key();
    let key = PresharedKey {
        key_id: Uuid::new_v4(),
        key_prefix: generated.prefix,
        key_salt: generated.salt_hex,
        key_hash: generated.hash_hex,
        user_id: req.user_id,
        profile_id: req.profile_id,
        status: KeyStatus::Active,
        created_at: Utc::now(),
        expires_at: req.expires_at,
    };
    state.repo.insert_key(key.clone()).await?;

    // The plaintext appears here and nowhere else.
    Ok(Json(serde_json::json!({
        "key_id": key.key_id,
        "preshared_key": generated.raw,
        "key_prefix": key.key_prefix,
        "user_id": key.user_id,
        "profile_id": key.profile_id,
        "expires_at": key.expires_at,
    })))
}

pub async fn revoke_key(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .repo
        .set_key_status(key_id, KeyStatus::Revoked)
        .await?;
    Ok(Json(serde_json::json!({ "key_id": key_id, "status": "revoked" })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sessions(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions: Vec<Value> = state
        .repo
        .list_sessions()
        .await?
        .into_iter()
        .map(|s| {
            serde_json::json!({
                "session_id": s.session_id,
                "user_id": s.user_id,
                "profile_id": s.profile_id,
                "status": s.status,
                "created_at": s.created_at,
                "last_activity_at": s.last_activity_at,
                "expires_at": s.expires_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

pub async fn terminate_session(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let _permit = state.session_locks.acquire(session_id).await;
    let mut session = state
        .repo
        .get_session(session_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
    if session.status == SessionStatus::Expired {
        return Ok(Json(serde_json::json!({ "session_id": session_id, "status": "expired" })));
    }

    let user_id = session.user_id;
    let now = Utc::now();
    session.status = SessionStatus::Expired;
    state.repo.update_session(session).await?;
    disconnect_session_connections(state.repo.as_ref(), session_id, now).await?;

    if state.repo.live_sessions_for_user(user_id).await?.is_empty() {
        state.user_pool.terminate_for_user(user_id).await;
    }

    state.pipeline.emit(
        AuditEvent::new(
            EventType::SessionExpired,
            Severity::Info,
            "terminate_session",
            "admin",
        )
        .session(session_id, user_id),
    )?;

    Ok(Json(serde_json::json!({ "session_id": session_id, "status": "expired" })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kill switches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct KillSwitchRequest {
    pub kind: KillSwitchKind,
    #[serde(default)]
    pub target: String,
    pub engaged: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn set_kill_switch(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<KillSwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.engaged {
        state
            .kill_switches
            .engage(req.kind, &req.target, req.reason.clone());
    } else {
        state.kill_switches.release(req.kind, &req.target);
    }

    state.pipeline.emit(
        AuditEvent::new(
            EventType::KillSwitchToggled,
            Severity::Warn,
            "set_kill_switch",
            "admin",
        )
        .meta(
            "switch",
            serde_json::json!({
                "kind": req.kind,
                "target": req.target,
                "engaged": req.engaged,
            }),
        ),
    )?;

    Ok(Json(serde_json::json!({
        "switches": state.kill_switches.list(),
    })))
}

pub async fn list_kill_switches(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(serde_json::json!({
        "switches": state.kill_switches.list(),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/admin/rotate-hmac-secret
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn rotate_hmac_secret(
    _guard: AdminGuard,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let invalidated = state
        .auth
        .rotate_hmac_secret(random_secret(), Utc::now())
        .await?;

    state.pipeline.emit(
        AuditEvent::new(
            EventType::HmacRotated,
            Severity::Warn,
            "rotate_hmac_secret",
            "admin",
        )
        .meta("sessions_invalidated", Value::from(invalidated)),
    )?;

    Ok(Json(serde_json::json!({ "sessionsInvalidated": invalidated })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP catalog management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub servers: Vec<McpCatalogEntry>,
}

/// Reconcile the running MCP set against a desired catalog: shared entries
/// go through the single-flight reconcile; per-user entries are swapped in
/// and running instances marked stale on fingerprint drift.
pub async fn reconcile_mcps(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    use amb_domain::config::IsolationMode;

    let (shared, per_user): (Vec<_>, Vec<_>) = req
        .servers
        .into_iter()
        .partition(|e| e.isolation == IsolationMode::Shared);

    let report = state.shared_mcps.apply_changes(shared).await?;
    state.user_pool.update_configs(per_user);

    Ok(Json(serde_json::json!({ "shared": report })))
}

/// Ephemeral discovery: start a connection from the submitted config just
/// long enough to capture its catalog, then tear it down.
pub async fn discover_mcp(
    _guard: AdminGuard,
    Json(entry): Json<McpCatalogEntry>,
) -> Result<impl IntoResponse, ApiError> {
    let connection = DownstreamConnection::new(entry);
    connection.start(&Default::default()).await?;
    let tools = connection.get_tools();
    connection.stop().await;

    Ok(Json(serde_json::json!({
        "count": tools.len(),
        "tools": tools,
    })))
}
