pub mod admin;
pub mod audit;
pub mod auth;
pub mod error;
pub mod sessions;
pub mod tools;

use axum::middleware;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Three tiers:
/// - **public** — health probe and session registration (the registration
///   endpoint authenticates by preshared key in the body),
/// - **session** — authenticated by `X-Session-Token`; the invoke and
///   heartbeat handlers verify the token themselves as part of their
///   contract, the rest sit behind the session middleware,
/// - **admin** — gated per handler by the `AdminGuard` extractor.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/sessions/register", post(sessions::register))
        .route("/v1/sessions/heartbeat", post(sessions::heartbeat))
        .route("/v1/tools/invoke", post(tools::invoke_tool));

    let session_scoped = Router::new()
        .route("/v1/tools", get(tools::list_tools))
        .route(
            "/v1/sessions/connections/:id",
            delete(sessions::disconnect),
        )
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_session,
        ));

    let admin = Router::new()
        .route("/v1/admin/info", get(admin::system_info))
        .route("/v1/admin/users", post(admin::create_user))
        .route("/v1/admin/users", get(admin::list_users))
        .route("/v1/admin/users/:id/status", post(admin::set_user_status))
        .route("/v1/admin/profiles", get(admin::list_profiles))
        .route("/v1/admin/profiles", post(admin::upsert_profile))
        .route("/v1/admin/profiles/:id", delete(admin::delete_profile))
        .route("/v1/admin/keys", post(admin::create_key))
        .route("/v1/admin/keys/:id/revoke", post(admin::revoke_key))
        .route("/v1/admin/sessions", get(admin::list_sessions))
        .route(
            "/v1/admin/sessions/:id/terminate",
            post(admin::terminate_session),
        )
        .route("/v1/admin/kill-switch", get(admin::list_kill_switches))
        .route("/v1/admin/kill-switch", post(admin::set_kill_switch))
        .route(
            "/v1/admin/rotate-hmac-secret",
            post(admin::rotate_hmac_secret),
        )
        .route("/v1/admin/mcps/reconcile", post(admin::reconcile_mcps))
        .route("/v1/admin/mcps/discover", post(admin::discover_mcp))
        .route("/v1/audit/events", get(audit::list_events));

    public
        .merge(session_scoped)
        .merge(admin)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Liveness probe. Returns nothing but the status on purpose.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
