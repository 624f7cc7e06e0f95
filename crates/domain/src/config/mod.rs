mod audit;
mod mcp;
mod pool;
mod server;
mod sessions;
mod storage;

pub use audit::*;
pub use mcp::*;
pub use pool::*;
pub use server::*;
pub use sessions::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Downstream MCP catalog (shared and per-user entries).
    #[serde(default)]
    pub mcp: McpConfig,
    /// Per-user MCP pool caps and maintenance intervals.
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Static per-user downstream credentials:
    /// `user_id → mcp name → env var → value`. Stands in for the external
    /// credential vault; swap via the `CredentialSource` seam in `amb-mcp`.
    #[serde(default)]
    pub credentials: HashMap<String, HashMap<String, HashMap<String, String>>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path the HMAC secret lives at (raw bytes, owner-only, replaced by
    /// atomic rename on rotation).
    #[serde(default = "d_hmac_secret_path")]
    pub hmac_secret_path: std::path::PathBuf,

    /// Environment variable holding the admin bearer token.
    /// If the env var is unset, admin endpoints are **disabled**.
    #[serde(default = "d_admin_token_env")]
    pub admin_token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hmac_secret_path: d_hmac_secret_path(),
            admin_token_env: d_admin_token_env(),
        }
    }
}

fn d_hmac_secret_path() -> std::path::PathBuf {
    "./data/hmac.secret".into()
}
fn d_admin_token_env() -> String {
    "AMB_ADMIN_TOKEN".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        // Session TTL must respect the hard ceiling.
        if self.sessions.ttl_seconds > self.sessions.ttl_hard_max_seconds {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.ttl_seconds".into(),
                message: format!(
                    "ttl_seconds ({}) exceeds ttl_hard_max_seconds ({})",
                    self.sessions.ttl_seconds, self.sessions.ttl_hard_max_seconds
                ),
            });
        }

        if self.sessions.heartbeat_min_interval_seconds == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "sessions.heartbeat_min_interval_seconds".into(),
                message: "heartbeat rate limiting disabled".into(),
            });
        }

        // MCP catalog entries.
        let mut seen_names: HashSet<&str> = HashSet::new();
        for (i, entry) in self.mcp.servers.iter().enumerate() {
            if entry.name.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].name"),
                    message: "name must not be empty".into(),
                });
            }
            if !entry.name.is_empty() && !seen_names.insert(&entry.name) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].name"),
                    message: format!("duplicate MCP name \"{}\"", entry.name),
                });
            }
            match entry.transport {
                McpTransportKind::Stdio => {
                    if entry.command.is_empty() {
                        errors.push(ConfigError {
                            severity: ConfigSeverity::Error,
                            field: format!("mcp.servers[{i}].command"),
                            message: "stdio transport requires a command".into(),
                        });
                    }
                }
                McpTransportKind::Http => {
                    let url = entry.url.as_deref().unwrap_or("");
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        errors.push(ConfigError {
                            severity: ConfigSeverity::Error,
                            field: format!("mcp.servers[{i}].url"),
                            message: format!(
                                "http transport requires an http(s) url (got \"{url}\")"
                            ),
                        });
                    }
                }
            }
        }

        // Pool caps.
        if self.pool.max_total_instances == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "pool.max_total_instances".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.pool.max_instances_per_user == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "pool.max_instances_per_user".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.pool.max_instances_per_user > self.pool.max_total_instances {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "pool.max_instances_per_user".into(),
                message: "per-user cap exceeds the global cap and can never be reached"
                    .into(),
            });
        }

        // Audit buffer.
        if self.audit.ring_capacity == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "audit.ring_capacity".into(),
                message: "ring capacity must be at least 1".into(),
            });
        }
        if self.audit.spill_path.is_some() && self.audit.spill_max_bytes == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "audit.spill_max_bytes".into(),
                message: "spill cap must be non-zero when a spill path is set".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn ttl_over_ceiling_is_an_error() {
        let mut config = Config::default();
        config.sessions.ttl_seconds = config.sessions.ttl_hard_max_seconds + 1;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error
                && e.field == "sessions.ttl_seconds"));
    }

    #[test]
    fn duplicate_mcp_names_rejected() {
        let mut config = Config::default();
        for _ in 0..2 {
            config.mcp.servers.push(McpCatalogEntry {
                name: "fs".into(),
                command: "mcp-fs".into(),
                ..Default::default()
            });
        }
        assert!(config
            .validate()
            .iter()
            .any(|e| e.message.contains("duplicate MCP name")));
    }

    #[test]
    fn http_entry_requires_url() {
        let mut config = Config::default();
        config.mcp.servers.push(McpCatalogEntry {
            name: "remote".into(),
            transport: McpTransportKind::Http,
            ..Default::default()
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.field.contains("url")));
    }
}
