//! Tool API endpoints.
//!
//! - `GET  /v1/tools`        — the session's catalog, filtered by its profile
//! - `POST /v1/tools/invoke` — invoke one tool through the AAA pipeline

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use axum::Extension;
use chrono::Utc;

use amb_authz::authorize;
use amb_domain::entity::SessionContext;

use crate::api::auth::{client_ip, session_token};
use crate::api::error::ApiError;
use crate::pipeline::InvokeRequest;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The catalog a session is actually allowed to call: the union of its
/// per-user and shared catalogs, minus anything its profile would deny.
pub async fn list_tools(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = state.pipeline.effective_profile(ctx.profile_id).await?;
    let now = Utc::now();

    let tools: Vec<_> = state
        .tool_router
        .get_tool_catalog(ctx.user_id)
        .await
        .into_iter()
        .filter(|t| authorize(&profile, &t.name, None, now).permit)
        .collect();

    Ok(Json(serde_json::json!({
        "count": tools.len(),
        "tools": tools,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/tools/invoke
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-level errors from the MCP (`isError: true`) are successful HTTP
/// responses; only transport and policy failures map to error statuses.
pub async fn invoke_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InvokeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let presented = session_token(&headers)?;
    let ip = client_ip(&headers);

    let router = state.tool_router.clone();
    let outcome = state
        .pipeline
        .invoke(presented, &ip, req, move |ctx, tool, arguments| async move {
            router.invoke(ctx.user_id, &tool, arguments).await
        })
        .await?;

    Ok(Json(serde_json::json!({
        "content": outcome.result.content,
        "isError": outcome.result.is_error,
        "duration_ms": outcome.duration_ms,
    })))
}
