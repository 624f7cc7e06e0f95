use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use amb_domain::config::{Config, ConfigSeverity};
use amb_gateway::cli::{Cli, Command, ConfigCommand};
use amb_gateway::{api, bootstrap};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ambassador: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, path) = amb_gateway::cli::load_config(cli.config.as_deref())?;
            if !report_validation(&config) {
                tracing::error!(path = %path.display(), "config validation failed");
                return Ok(2);
            }
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, path) = amb_gateway::cli::load_config(cli.config.as_deref())?;
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                Ok(2)
            } else {
                println!("{}: ok", path.display());
                Ok(0)
            }
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = amb_gateway::cli::load_config(cli.config.as_deref())?;
            println!(
                "{}",
                toml::to_string_pretty(&config).context("serializing config")?
            );
            Ok(0)
        }
        Some(Command::Version) => {
            println!("ambassador {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,amb_gateway=debug")),
        )
        .json()
        .init();
}

/// Log validation issues; returns `false` when any error-severity issue is
/// present.
fn report_validation(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    !issues.iter().any(|i| i.severity == ConfigSeverity::Error)
}

/// Start the gateway with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<i32> {
    tracing::info!(
        node = %config.server.node_name,
        "MCP Ambassador starting"
    );

    let state = bootstrap::build_app_state(config.clone()).await?;
    bootstrap::spawn_background_tasks(&state);

    let app = api::router(state.clone())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "MCP Ambassador listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("axum server error")?;
            Ok(0)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            // Final flushes before the process goes away.
            state.audit.shutdown().await;
            if let Err(e) = state.repo.flush() {
                tracing::warn!(error = %e, "final repository snapshot failed");
            }
            state.shared_mcps.shutdown().await;
            Ok(130)
        }
    }
}
