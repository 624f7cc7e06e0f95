//! Session API endpoints.
//!
//! - `POST   /v1/sessions/register`          — exchange a preshared key for a token
//! - `POST   /v1/sessions/heartbeat`         — extend a session, wake it from idle
//! - `DELETE /v1/sessions/connections/{id}`  — graceful disconnect of one host tool

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use axum::Extension;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use amb_audit::{AuditEvent, EventType, Severity};
use amb_domain::entity::{ConnectionStatus, SessionConnection, SessionContext};
use amb_domain::error::Error;
use amb_sessions::{token, SessionRepository};

use crate::api::auth::{client_ip, session_token};
use crate::api::error::ApiError;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/register
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub preshared_key: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub host_tool: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ip = client_ip(&headers);
    let now = Utc::now();

    let registered = match state
        .auth
        .register_session(&req.preshared_key, &ip, now)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let event_type = match &e {
                Error::RateLimited(_) => EventType::RateLimited,
                _ => EventType::AuthFailure,
            };
            state.pipeline.emit(AuditEvent::new(
                event_type,
                Severity::Warn,
                "register_session",
                &ip,
            ))?;
            return Err(e.into());
        }
    };

    // Record the host tool as a session connection.
    let connection = SessionConnection {
        connection_id: Uuid::new_v4(),
        session_id: registered.session_id,
        friendly_name: req.friendly_name.unwrap_or_else(|| "unnamed".into()),
        host_tool: req.host_tool.unwrap_or_else(|| "unknown".into()),
        connected_at: now,
        last_heartbeat_at: now,
        disconnected_at: None,
        status: ConnectionStatus::Connected,
    };
    state.repo.insert_connection(connection.clone()).await?;

    // Bring up the user's per-user MCPs. Quota exhaustion does not fail the
    // registration; the session simply sees only shared tools.
    if let Err(e) = state.user_pool.spawn_for_user(registered.user_id).await {
        tracing::warn!(
            user_id = %registered.user_id,
            error = %e,
            "per-user pool unavailable at registration"
        );
    }

    state.pipeline.emit(
        AuditEvent::new(
            EventType::SessionRegister,
            Severity::Info,
            "register_session",
            &ip,
        )
        .session(registered.session_id, registered.user_id)
        .meta(
            "host_tool",
            Value::String(connection.host_tool.clone()),
        ),
    )?;

    Ok(Json(serde_json::json!({
        "session_id": registered.session_id,
        "session_token": registered.session_token,
        "expires_at": registered.expires_at,
        "connection_id": connection.connection_id,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let presented = session_token(&headers)?;
    let now = Utc::now();

    // Serialize against the lifecycle evaluator for this session.
    let _permit = match token::decode_token(presented) {
        Ok((_, session_id)) => Some(state.session_locks.acquire(session_id).await),
        Err(_) => None,
    };

    let outcome = state.auth.heartbeat(presented, now).await?;

    if outcome.respawn_pool {
        if let Err(e) = state.user_pool.spawn_for_user(outcome.user_id).await {
            tracing::warn!(
                user_id = %outcome.user_id,
                error = %e,
                "pool respawn on heartbeat failed"
            );
        }
    }

    Ok(Json(serde_json::json!({
        "session_id": outcome.session_id,
        "status": "active",
        "expires_at": outcome.expires_at,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /v1/sessions/connections/{id}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(connection_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut connection = state
        .repo
        .get_connection(connection_id)
        .await?
        .filter(|c| c.session_id == ctx.session_id)
        .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;

    if connection.status == ConnectionStatus::Connected {
        connection.status = ConnectionStatus::Disconnected;
        connection.disconnected_at = Some(Utc::now());
        state.repo.update_connection(connection).await?;
    }

    Ok(Json(serde_json::json!({ "status": "disconnected" })))
}
