use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_8420")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Informational node label stamped into audit event metadata.
    #[serde(default = "d_node_name")]
    pub node_name: String,
    /// In-flight request ceiling for the HTTP listener.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8420,
            host: "127.0.0.1".into(),
            node_name: d_node_name(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_8420() -> u16 {
    8420
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_node_name() -> String {
    "ambassador-1".into()
}
fn d_max_concurrent() -> usize {
    256
}
