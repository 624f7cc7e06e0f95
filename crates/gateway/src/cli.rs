//! Command-line interface for the `ambassador` binary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use amb_domain::config::Config;

/// Default config path when neither `--config` nor `AMB_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "./ambassador.toml";

#[derive(Parser)]
#[command(name = "ambassador", version, about = "MCP Ambassador gateway")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Resolve and load the configuration.
///
/// Resolution order: `--config`, then `AMB_CONFIG`, then
/// [`DEFAULT_CONFIG_PATH`]. A missing file yields the built-in defaults with
/// a warning; an unreadable or unparsable file is an error.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path: PathBuf = match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var("AMB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let (config, _) = load_config(Some(Path::new("/nonexistent/amb.toml"))).unwrap();
        assert_eq!(config.server.port, 8420);
    }

    #[test]
    fn parses_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ambassador.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9000

[sessions]
ttl_seconds = 1800
"#,
        )
        .unwrap();
        let (config, loaded_from) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sessions.ttl_seconds, 1800);
        assert_eq!(loaded_from, path);
    }

    #[test]
    fn garbage_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not toml [[[").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
