//! Tool router — resolves a tool name to the connection that owns it.
//!
//! Per-user instances are checked first so a user's own MCP always shadows a
//! same-named shared tool; anything not found in either catalog is
//! `tool_not_found`.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use amb_domain::error::{Error, Result};

use crate::pool::UserMcpPool;
use crate::protocol::{ToolCallResult, ToolDescriptor};
use crate::shared::SharedMcpManager;

/// Where a tool call will be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// One of the user's per-user instances.
    PerUser { mcp: String },
    /// A shared connection.
    Shared { mcp: String },
}

impl RouteTarget {
    pub fn mcp(&self) -> &str {
        match self {
            Self::PerUser { mcp } | Self::Shared { mcp } => mcp,
        }
    }
}

pub struct ToolRouter {
    shared: Arc<SharedMcpManager>,
    pool: Arc<UserMcpPool>,
}

impl ToolRouter {
    pub fn new(shared: Arc<SharedMcpManager>, pool: Arc<UserMcpPool>) -> Self {
        Self { shared, pool }
    }

    /// Resolve which connection owns `tool_name` for this user.
    pub async fn route(&self, user_id: Uuid, tool_name: &str) -> Result<RouteTarget> {
        if self.pool.owns_tool(user_id, tool_name).await {
            // Namespaced per-user tools are `<mcp>.<tool>`.
            let mcp = tool_name
                .split('.')
                .next()
                .unwrap_or(tool_name)
                .to_owned();
            return Ok(RouteTarget::PerUser { mcp });
        }
        if let Some(conn) = self.shared.find_connection(tool_name).await {
            return Ok(RouteTarget::Shared {
                mcp: conn.name().to_owned(),
            });
        }
        Err(Error::ToolNotFound(tool_name.to_owned()))
    }

    /// Union of the user's per-user catalog and the shared catalog.
    pub async fn get_tool_catalog(&self, user_id: Uuid) -> Vec<ToolDescriptor> {
        let mut catalog = self.pool.get_tool_catalog(user_id).await;
        catalog.extend(self.shared.get_tool_catalog().await);
        catalog
    }

    pub async fn get_tool_descriptor(
        &self,
        user_id: Uuid,
        tool_name: &str,
    ) -> Option<ToolDescriptor> {
        self.get_tool_catalog(user_id)
            .await
            .into_iter()
            .find(|t| t.name == tool_name)
    }

    /// Route and invoke in one step.
    pub async fn invoke(
        &self,
        user_id: Uuid,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult> {
        match self.route(user_id, tool_name).await? {
            RouteTarget::PerUser { .. } => {
                self.pool.invoke_tool(user_id, tool_name, arguments).await
            }
            RouteTarget::Shared { .. } => self.shared.invoke_tool(tool_name, arguments).await,
        }
    }
}
