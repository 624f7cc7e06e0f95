//! Audit query endpoint.
//!
//! - `GET /v1/audit/events?offset=0&limit=100` — newest first, paginated.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::api::auth::AdminGuard;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn list_events(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    let limit = query.limit.min(1_000);
    let events = state.audit_log.recent(query.offset, limit);
    Json(serde_json::json!({
        "offset": query.offset,
        "limit": limit,
        "count": events.len(),
        "dropped_total": state.audit.dropped_count(),
        "events": events,
    }))
}
