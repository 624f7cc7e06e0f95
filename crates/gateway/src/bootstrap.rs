//! AppState construction and background-task spawning extracted from
//! `main.rs`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use amb_audit::{AuditBuffer, AuditEvent, AuditSink, EventType, MemorySink, Severity, TracingSink};
use amb_domain::config::Config;
use amb_mcp::{SharedMcpManager, StaticCredentials, ToolRouter, UserMcpPool};
use amb_sessions::lifecycle::{LifecycleEvent, PoolHandle};
use amb_sessions::{
    EphemeralAuthProvider, HmacSecret, MemoryRepository, SessionLifecycleManager,
};

use crate::kill_switch::KillSwitchTable;
use crate::pipeline::Pipeline;
use crate::state::AppState;

/// Flushes to the structured log and retains events for the admin query
/// endpoint.
struct TeeSink {
    memory: Arc<MemorySink>,
    log: TracingSink,
}

#[async_trait]
impl AuditSink for TeeSink {
    async fn flush(&self, events: Vec<AuditEvent>) -> amb_domain::error::Result<()> {
        self.log.flush(events.clone()).await?;
        self.memory.flush(events).await
    }
}

/// Adapts the per-user pool to the lifecycle engine's seam.
struct PoolAdapter(Arc<UserMcpPool>);

#[async_trait]
impl PoolHandle for PoolAdapter {
    async fn terminate_for_user(&self, user_id: Uuid) {
        self.0.terminate_for_user(user_id).await;
    }
}

/// Initialize every subsystem and return a fully-wired [`AppState`].
/// Assumes the config has already passed validation.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Repository ───────────────────────────────────────────────────
    let repo = Arc::new(
        MemoryRepository::with_snapshot(&config.storage.state_path)
            .context("initializing session repository")?,
    );

    // ── HMAC secret + auth provider ──────────────────────────────────
    let secret = Arc::new(
        HmacSecret::load_or_create(&config.auth.hmac_secret_path)
            .context("loading HMAC secret")?,
    );
    let auth = Arc::new(EphemeralAuthProvider::new(
        repo.clone(),
        secret,
        config.auth.hmac_secret_path.clone(),
        config.sessions.clone(),
    ));
    tracing::info!("auth provider ready");

    // ── Shared MCPs ──────────────────────────────────────────────────
    let shared_mcps = Arc::new(SharedMcpManager::new());
    let shared_entries: Vec<_> = config.mcp.shared().cloned().collect();
    if shared_entries.is_empty() {
        tracing::info!("no shared MCPs configured");
    } else {
        tracing::info!(count = shared_entries.len(), "initializing shared MCPs");
        shared_mcps.initialize(shared_entries).await;
    }

    // ── Per-user MCP pool ────────────────────────────────────────────
    let credentials = Arc::new(StaticCredentials::new(config.credentials.clone()));
    let user_pool = Arc::new(UserMcpPool::new(
        config.pool.clone(),
        config.mcp.per_user().cloned().collect(),
        credentials,
    ));
    tracing::info!(
        max_total = config.pool.max_total_instances,
        max_per_user = config.pool.max_instances_per_user,
        "per-user MCP pool ready"
    );

    // ── Tool router ──────────────────────────────────────────────────
    let tool_router = Arc::new(ToolRouter::new(shared_mcps.clone(), user_pool.clone()));

    // ── Audit ────────────────────────────────────────────────────────
    let audit_log = Arc::new(MemorySink::default());
    let audit = Arc::new(AuditBuffer::new(
        config.audit.clone(),
        Arc::new(TeeSink {
            memory: audit_log.clone(),
            log: TracingSink,
        }),
    ));
    tracing::info!(
        ring = config.audit.ring_capacity,
        spill = config.audit.spill_path.is_some(),
        "audit buffer ready"
    );

    // ── Kill switches + pipeline ─────────────────────────────────────
    let kill_switches = Arc::new(KillSwitchTable::new());
    let pipeline = Arc::new(Pipeline::new(
        repo.clone(),
        auth.clone(),
        kill_switches.clone(),
        audit.clone(),
        config.audit.failure_mode,
        config.server.node_name.clone(),
    ));

    // ── Lifecycle ────────────────────────────────────────────────────
    let lifecycle = Arc::new(SessionLifecycleManager::new(
        repo.clone(),
        Arc::new(PoolAdapter(user_pool.clone())),
        config.sessions.clone(),
    ));
    let session_locks = lifecycle.locks();
    tracing::info!(
        evaluator_s = config.sessions.evaluator_interval_seconds,
        sweeper_s = config.sessions.sweeper_interval_seconds,
        "lifecycle manager ready"
    );

    // ── Admin token (read once, hash for constant-time comparison) ──
    let admin_token_hash = match std::env::var(&config.auth.admin_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var = %config.auth.admin_token_env, "admin bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.auth.admin_token_env,
                "admin API DISABLED — set the admin token env var to enable"
            );
            None
        }
    };

    Ok(AppState {
        config,
        repo,
        auth,
        lifecycle,
        session_locks,
        shared_mcps,
        user_pool,
        tool_router,
        pipeline,
        kill_switches,
        audit,
        audit_log,
        admin_token_hash,
        started_at: Utc::now(),
    })
}

/// Spawn the long-running background tasks (audit flusher, lifecycle
/// evaluator + sweeper, repository snapshots, pool health + reaping,
/// limiter pruning).
///
/// Call this **after** [`build_app_state`] when running the server.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Audit flusher ────────────────────────────────────────────────
    tokio::spawn(state.audit.clone().run_flusher());

    // ── Lifecycle evaluator ──────────────────────────────────────────
    {
        let lifecycle = state.lifecycle.clone();
        let pipeline = state.pipeline.clone();
        let period = state.config.sessions.evaluator_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                match lifecycle.evaluate_tick(Utc::now()).await {
                    Ok(events) => {
                        for event in events {
                            if let LifecycleEvent::Expired {
                                session_id,
                                user_id,
                                ..
                            }
                            | LifecycleEvent::SpunDown {
                                session_id,
                                user_id,
                                ..
                            } = event
                            {
                                let _ = pipeline.emit(
                                    AuditEvent::new(
                                        EventType::SessionExpired,
                                        Severity::Info,
                                        "lifecycle_evaluator",
                                        "internal",
                                    )
                                    .session(session_id, user_id),
                                );
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "lifecycle evaluator tick failed"),
                }
            }
        });
    }

    // ── Lifecycle sweeper ────────────────────────────────────────────
    {
        let lifecycle = state.lifecycle.clone();
        let period = state.config.sessions.sweeper_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                if let Err(e) = lifecycle.sweep_tick(Utc::now()).await {
                    tracing::warn!(error = %e, "lifecycle sweeper tick failed");
                }
            }
        });
    }

    // ── Repository snapshots ─────────────────────────────────────────
    {
        let repo = state.repo.clone();
        let period = state.config.storage.snapshot_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                if let Err(e) = repo.flush() {
                    tracing::warn!(error = %e, "repository snapshot failed");
                }
            }
        });
    }

    // ── Per-user pool health checks ──────────────────────────────────
    {
        let pool = state.user_pool.clone();
        let period = state.config.pool.health_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                pool.health_tick().await;
            }
        });
    }

    // ── Per-user pool idle reaper ────────────────────────────────────
    {
        let pool = state.user_pool.clone();
        let period = state.config.pool.reap_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                pool.reap_tick(Utc::now()).await;
            }
        });
    }

    // ── Limiter + lock pruning (hourly) ──────────────────────────────
    {
        let auth = state.auth.clone();
        let locks = state.session_locks.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(3_600));
            loop {
                interval.tick().await;
                auth.prune_limiters(Utc::now());
                locks.prune_idle();
            }
        });
    }

    tracing::info!("background tasks spawned");
}
