use amb_domain::config::Config;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
}

#[test]
fn explicit_bind_host_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 8420
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn session_defaults_match_contract() {
    let config = Config::default();
    assert_eq!(config.sessions.ttl_hard_max_seconds, 86_400);
    assert_eq!(config.sessions.evaluator_interval_seconds, 60);
    assert_eq!(config.sessions.sweeper_interval_seconds, 900);
    assert_eq!(config.sessions.heartbeat_min_interval_seconds, 5);
}

#[test]
fn audit_defaults_match_contract() {
    let config = Config::default();
    assert_eq!(config.audit.ring_capacity, 10_000);
    assert_eq!(config.audit.flush_interval_ms, 5_000);
    assert!(config.audit.spill_path.is_none());
}

#[test]
fn mcp_catalog_parses_from_toml() {
    let toml_str = r#"
[[mcp.servers]]
name = "demo"
command = "demo-mcp"
args = ["--stdio"]

[[mcp.servers]]
name = "jira"
transport = "http"
url = "https://mcp.example.com/jira"
isolation = "per_user"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.mcp.servers.len(), 2);
    assert_eq!(config.mcp.shared().count(), 1);
    assert_eq!(config.mcp.per_user().count(), 1);
}
