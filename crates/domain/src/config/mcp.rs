//! Downstream MCP catalog configuration.
//!
//! These are lightweight config structs used to deserialize the `[mcp]`
//! section of the gateway config. The connection logic lives in the
//! `amb-mcp` crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level MCP catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// Downstream MCP definitions, shared and per-user.
    #[serde(default)]
    pub servers: Vec<McpCatalogEntry>,
}

impl McpConfig {
    pub fn shared(&self) -> impl Iterator<Item = &McpCatalogEntry> {
        self.servers
            .iter()
            .filter(|e| e.isolation == IsolationMode::Shared)
    }

    pub fn per_user(&self) -> impl Iterator<Item = &McpCatalogEntry> {
        self.servers
            .iter()
            .filter(|e| e.isolation == IsolationMode::PerUser)
    }
}

/// Configuration for one downstream MCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCatalogEntry {
    /// Unique name. Doubles as the tool namespace for per-user catalogs.
    pub name: String,

    /// Transport type (`"stdio"` or `"http"`).
    #[serde(default)]
    pub transport: McpTransportKind,

    /// Command to spawn (stdio transport).
    #[serde(default)]
    pub command: String,

    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Base environment for the spawned process. Per-user credentials are
    /// layered on top for `per_user` entries.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Endpoint URL (http transport).
    #[serde(default)]
    pub url: Option<String>,

    /// Whether one process serves everyone or each user gets their own.
    #[serde(default)]
    pub isolation: IsolationMode,

    /// Per-call deadline for `tools/call`.
    #[serde(default = "d_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Deadline for spawn + initialize + tools/list.
    #[serde(default = "d_start_timeout")]
    pub start_timeout_seconds: u64,
}

impl Default for McpCatalogEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            transport: McpTransportKind::default(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            isolation: IsolationMode::default(),
            call_timeout_seconds: d_call_timeout(),
            start_timeout_seconds: d_start_timeout(),
        }
    }
}

/// Transport kind for connecting to an MCP.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Http,
}

/// Isolation mode: one shared process, or one process per user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    #[default]
    Shared,
    PerUser,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_call_timeout() -> u64 {
    30
}
fn d_start_timeout() -> u64 {
    10
}
