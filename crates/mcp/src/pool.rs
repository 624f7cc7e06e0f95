//! Per-user MCP pool — one instance of each `per_user` catalog entry per
//! user, spawned on demand under strict admission control and torn down when
//! the owning sessions go away.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use amb_domain::config::{McpCatalogEntry, PoolConfig};
use amb_domain::error::{Error, Result};

use crate::connection::{config_fingerprint, ConnectionState, DownstreamConnection};
use crate::protocol::{ToolCallResult, ToolDescriptor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Seam to the external credential vault. The pool asks it for the decrypted
/// per-user environment of each MCP; `None` means the user has no access and
/// no instance is spawned.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials_for(
        &self,
        user_id: Uuid,
        mcp: &str,
    ) -> Option<HashMap<String, String>>;
}

/// Config-backed credential source: `user_id → mcp → env`.
#[derive(Default)]
pub struct StaticCredentials {
    users: HashMap<String, HashMap<String, HashMap<String, String>>>,
}

impl StaticCredentials {
    pub fn new(users: HashMap<String, HashMap<String, HashMap<String, String>>>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials_for(
        &self,
        user_id: Uuid,
        mcp: &str,
    ) -> Option<HashMap<String, String>> {
        self.users
            .get(&user_id.to_string())
            .and_then(|mcps| mcps.get(mcp))
            .cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool slots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct UserInstance {
    connection: Arc<DownstreamConnection>,
    /// Set when the catalog entry's fingerprint changed; reaped once idle.
    stale: bool,
    last_used: DateTime<Utc>,
}

/// A slot counts against quotas from the moment it is reserved, so a slow
/// spawn cannot be raced past the caps.
enum PoolSlot {
    Starting,
    Ready(UserInstance),
}

impl PoolSlot {
    fn instance(&self) -> Option<&UserInstance> {
        match self {
            Self::Ready(i) => Some(i),
            Self::Starting => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UserMcpPool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supervisor for per-user MCP instances.
///
/// Admission policy, in order:
/// 1. global running total would exceed `max_total_instances` → `pool_exhausted`
/// 2. the user's count would exceed `max_instances_per_user` → `user_quota_exceeded`
/// 3. otherwise spawn.
pub struct UserMcpPool {
    limits: PoolConfig,
    configs: parking_lot::RwLock<HashMap<String, McpCatalogEntry>>,
    instances: tokio::sync::Mutex<HashMap<Uuid, HashMap<String, PoolSlot>>>,
    credentials: Arc<dyn CredentialSource>,
}

impl UserMcpPool {
    pub fn new(
        limits: PoolConfig,
        per_user_configs: Vec<McpCatalogEntry>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let configs = per_user_configs
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        Self {
            limits,
            configs: parking_lot::RwLock::new(configs),
            instances: tokio::sync::Mutex::new(HashMap::new()),
            credentials,
        }
    }

    /// Spawn one instance of each per-user MCP the user has credentials for.
    /// Already-running instances are left alone; the call is idempotent with
    /// respect to them. Returns the number of instances started.
    pub async fn spawn_for_user(&self, user_id: Uuid) -> Result<usize> {
        let entries: Vec<McpCatalogEntry> = self.configs.read().values().cloned().collect();

        // Resolve credentials up front; entries without credentials are not
        // spawned and do not count against quotas.
        let mut candidates: Vec<(McpCatalogEntry, HashMap<String, String>)> = Vec::new();
        for entry in entries {
            if let Some(creds) = self.credentials.credentials_for(user_id, &entry.name).await {
                candidates.push((entry, creds));
            }
        }

        // Admission + slot reservation under one lock acquisition.
        let to_spawn: Vec<(McpCatalogEntry, HashMap<String, String>)> = {
            let mut guard = self.instances.lock().await;
            let existing: usize = guard
                .get(&user_id)
                .map(|m| m.len())
                .unwrap_or(0);
            let total: usize = guard.values().map(|m| m.len()).sum();

            let missing: Vec<_> = candidates
                .into_iter()
                .filter(|(entry, _)| {
                    guard
                        .get(&user_id)
                        .map_or(true, |m| !m.contains_key(&entry.name))
                })
                .collect();
            if missing.is_empty() {
                return Ok(0);
            }

            if total + missing.len() > self.limits.max_total_instances {
                return Err(Error::PoolExhausted);
            }
            if existing + missing.len() > self.limits.max_instances_per_user {
                return Err(Error::UserQuotaExceeded);
            }

            let user_map = guard.entry(user_id).or_default();
            for (entry, _) in &missing {
                user_map.insert(entry.name.clone(), PoolSlot::Starting);
            }
            missing
        };

        // Spawn outside the pool lock; a slow subprocess must not block other
        // users' admissions.
        let mut started = 0usize;
        for (entry, creds) in to_spawn {
            let name = entry.name.clone();
            let conn = Arc::new(DownstreamConnection::new(entry));
            match conn.start(&creds).await {
                Ok(()) => {
                    let mut guard = self.instances.lock().await;
                    if let Some(user_map) = guard.get_mut(&user_id) {
                        user_map.insert(
                            name.clone(),
                            PoolSlot::Ready(UserInstance {
                                connection: conn,
                                stale: false,
                                last_used: Utc::now(),
                            }),
                        );
                        started += 1;
                        tracing::info!(user = %user_id, mcp = %name, "per-user MCP started");
                    } else {
                        // The user was terminated while we were spawning.
                        conn.stop().await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        user = %user_id,
                        mcp = %name,
                        error = %e,
                        "per-user MCP failed to start"
                    );
                    let mut guard = self.instances.lock().await;
                    if let Some(user_map) = guard.get_mut(&user_id) {
                        user_map.remove(&name);
                        if user_map.is_empty() {
                            guard.remove(&user_id);
                        }
                    }
                }
            }
        }
        Ok(started)
    }

    /// Stop and remove every instance belonging to `user_id`, releasing the
    /// quota. Idempotent: a second call is a no-op.
    pub async fn terminate_for_user(&self, user_id: Uuid) {
        let slots = {
            let mut guard = self.instances.lock().await;
            guard.remove(&user_id)
        };
        let Some(slots) = slots else { return };
        for (name, slot) in slots {
            if let PoolSlot::Ready(instance) = slot {
                instance.connection.stop().await;
                tracing::info!(user = %user_id, mcp = %name, "per-user MCP terminated");
            }
        }
    }

    pub async fn has_active_instances(&self, user_id: Uuid) -> bool {
        let guard = self.instances.lock().await;
        guard
            .get(&user_id)
            .is_some_and(|m| m.values().any(|s| s.instance().is_some()))
    }

    /// Concatenation of the user's per-user catalogs, each tool namespaced
    /// as `<mcp>.<tool>`.
    pub async fn get_tool_catalog(&self, user_id: Uuid) -> Vec<ToolDescriptor> {
        let guard = self.instances.lock().await;
        let Some(user_map) = guard.get(&user_id) else {
            return Vec::new();
        };
        let mut catalog = Vec::new();
        for (name, slot) in user_map {
            let Some(instance) = slot.instance() else {
                continue;
            };
            if instance.connection.state() != ConnectionState::Ready {
                continue;
            }
            for mut tool in instance.connection.get_tools() {
                tool.name = format!("{name}.{}", tool.name);
                catalog.push(tool);
            }
        }
        catalog
    }

    /// Whether a namespaced tool resolves to one of the user's instances.
    pub async fn owns_tool(&self, user_id: Uuid, tool_name: &str) -> bool {
        self.resolve(user_id, tool_name).await.is_some()
    }

    /// Invoke a namespaced tool on the owning instance.
    pub async fn invoke_tool(
        &self,
        user_id: Uuid,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult> {
        let (conn, inner) = self
            .resolve(user_id, tool_name)
            .await
            .ok_or_else(|| Error::ToolNotFound(tool_name.to_owned()))?;
        let result = conn.call(&inner, arguments).await;
        if result.is_ok() {
            let mut guard = self.instances.lock().await;
            if let Some(slot) = guard
                .get_mut(&user_id)
                .and_then(|m| m.get_mut(conn.name()))
            {
                if let PoolSlot::Ready(instance) = slot {
                    instance.last_used = Utc::now();
                }
            }
        }
        result
    }

    async fn resolve(
        &self,
        user_id: Uuid,
        tool_name: &str,
    ) -> Option<(Arc<DownstreamConnection>, String)> {
        let guard = self.instances.lock().await;
        let user_map = guard.get(&user_id)?;
        for (name, slot) in user_map {
            let Some(instance) = slot.instance() else {
                continue;
            };
            let prefix = format!("{name}.");
            if let Some(inner) = tool_name.strip_prefix(&prefix) {
                if instance.connection.has_tool(inner) {
                    return Some((instance.connection.clone(), inner.to_owned()));
                }
            }
        }
        None
    }

    /// Swap in a new desired per-user config set. Instances whose entry's
    /// fingerprint changed (or disappeared) are marked stale; they keep
    /// serving their current sessions and are reaped once idle.
    pub fn update_configs(&self, desired: Vec<McpCatalogEntry>) {
        let fingerprints: HashMap<String, String> = desired
            .iter()
            .map(|e| (e.name.clone(), config_fingerprint(e)))
            .collect();
        *self.configs.write() = desired.into_iter().map(|e| (e.name.clone(), e)).collect();

        // Mark drifted instances without blocking callers for long.
        let mut guard = match self.instances.try_lock() {
            Ok(g) => g,
            Err(_) => return, // next maintenance tick will see the new configs
        };
        for user_map in guard.values_mut() {
            for (name, slot) in user_map.iter_mut() {
                if let PoolSlot::Ready(instance) = slot {
                    let current = instance.connection.config_fingerprint();
                    let drifted = fingerprints.get(name).map(String::as_str) != Some(current);
                    if drifted && !instance.stale {
                        instance.stale = true;
                        tracing::info!(mcp = %name, "per-user MCP config drifted, instance marked stale");
                    }
                }
            }
        }
    }

    /// Probe every running instance; dead ones are terminated (and respawn
    /// on next demand).
    pub async fn health_tick(&self) {
        let probes: Vec<(Uuid, String, Arc<DownstreamConnection>)> = {
            let guard = self.instances.lock().await;
            guard
                .iter()
                .flat_map(|(user, m)| {
                    m.iter().filter_map(|(name, slot)| {
                        slot.instance()
                            .map(|i| (*user, name.clone(), i.connection.clone()))
                    })
                })
                .collect()
        };

        for (user, name, conn) in probes {
            if conn.ping().await {
                continue;
            }
            tracing::warn!(user = %user, mcp = %name, "per-user MCP failed health check, terminating");
            conn.stop().await;
            let mut guard = self.instances.lock().await;
            if let Some(user_map) = guard.get_mut(&user) {
                user_map.remove(&name);
                if user_map.is_empty() {
                    guard.remove(&user);
                }
            }
        }
    }

    /// Reap instances idle past the idle timeout, and stale instances as
    /// soon as they have been quiet for one reap interval.
    pub async fn reap_tick(&self, now: DateTime<Utc>) {
        let idle_cutoff = chrono::Duration::seconds(self.limits.idle_timeout_seconds as i64);
        let stale_cutoff = chrono::Duration::seconds(self.limits.reap_interval_seconds as i64);

        let doomed: Vec<(Uuid, String, Arc<DownstreamConnection>)> = {
            let mut guard = self.instances.lock().await;
            let mut doomed = Vec::new();
            for (user, user_map) in guard.iter_mut() {
                let expired: Vec<String> = user_map
                    .iter()
                    .filter_map(|(name, slot)| {
                        let instance = slot.instance()?;
                        let idle_for = now.signed_duration_since(instance.last_used);
                        let reap = idle_for >= idle_cutoff
                            || (instance.stale && idle_for >= stale_cutoff);
                        reap.then(|| name.clone())
                    })
                    .collect();
                for name in expired {
                    if let Some(PoolSlot::Ready(instance)) = user_map.remove(&name) {
                        doomed.push((*user, name, instance.connection));
                    }
                }
            }
            guard.retain(|_, m| !m.is_empty());
            doomed
        };

        for (user, name, conn) in doomed {
            conn.stop().await;
            tracing::info!(user = %user, mcp = %name, "idle per-user MCP reaped");
        }
    }

    /// `(total running, per-user counts)` for admin introspection and tests.
    pub async fn counts(&self) -> (usize, HashMap<Uuid, usize>) {
        let guard = self.instances.lock().await;
        let per_user: HashMap<Uuid, usize> =
            guard.iter().map(|(u, m)| (*u, m.len())).collect();
        (per_user.values().sum(), per_user)
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(
        &self,
        user_id: Uuid,
        mcp: &str,
        connection: Arc<DownstreamConnection>,
        last_used: DateTime<Utc>,
        stale: bool,
    ) {
        let mut guard = self.instances.lock().await;
        guard.entry(user_id).or_default().insert(
            mcp.to_owned(),
            PoolSlot::Ready(UserInstance {
                connection,
                stale,
                last_used,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ready_connection;

    fn pool_with_limits(total: usize, per_user: usize) -> UserMcpPool {
        let limits = PoolConfig {
            max_total_instances: total,
            max_instances_per_user: per_user,
            ..Default::default()
        };
        UserMcpPool::new(limits, Vec::new(), Arc::new(StaticCredentials::default()))
    }

    fn echo_reply() -> Value {
        serde_json::json!({ "content": [{ "type": "text", "text": "ok" }] })
    }

    #[tokio::test]
    async fn namespaced_catalog_and_invoke() {
        let pool = pool_with_limits(8, 4);
        let user = Uuid::new_v4();
        pool.insert_for_test(
            user,
            "jira",
            ready_connection("jira", vec!["create_issue"], echo_reply()),
            Utc::now(),
            false,
        )
        .await;

        let catalog = pool.get_tool_catalog(user).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "jira.create_issue");

        assert!(pool.owns_tool(user, "jira.create_issue").await);
        assert!(!pool.owns_tool(user, "jira.unknown").await);
        assert!(!pool.owns_tool(Uuid::new_v4(), "jira.create_issue").await);

        let result = pool
            .invoke_tool(user, "jira.create_issue", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.content[0].text, "ok");
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_releases_quota() {
        let pool = pool_with_limits(8, 4);
        let user = Uuid::new_v4();
        pool.insert_for_test(
            user,
            "jira",
            ready_connection("jira", vec!["t"], echo_reply()),
            Utc::now(),
            false,
        )
        .await;
        assert!(pool.has_active_instances(user).await);

        pool.terminate_for_user(user).await;
        assert!(!pool.has_active_instances(user).await);
        let (total, _) = pool.counts().await;
        assert_eq!(total, 0);

        // Second terminate is a no-op.
        pool.terminate_for_user(user).await;
        let (total, _) = pool.counts().await;
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn global_cap_wins_over_user_quota() {
        // One slot globally, held by another user. Admission must report
        // pool_exhausted, not user_quota_exceeded.
        let mut users = HashMap::new();
        let u2 = Uuid::new_v4();
        users.insert(
            u2.to_string(),
            HashMap::from([("vault".to_string(), HashMap::new())]),
        );
        let limits = PoolConfig {
            max_total_instances: 1,
            max_instances_per_user: 1,
            ..Default::default()
        };
        let pool = UserMcpPool::new(
            limits,
            vec![McpCatalogEntry {
                name: "vault".into(),
                command: "vault-mcp".into(),
                ..Default::default()
            }],
            Arc::new(StaticCredentials::new(users)),
        );

        let u1 = Uuid::new_v4();
        pool.insert_for_test(
            u1,
            "vault",
            ready_connection("vault", vec!["t"], echo_reply()),
            Utc::now(),
            false,
        )
        .await;

        let err = pool.spawn_for_user(u2).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
    }

    #[tokio::test]
    async fn user_quota_enforced() {
        let u = Uuid::new_v4();
        let mut users = HashMap::new();
        users.insert(
            u.to_string(),
            HashMap::from([
                ("a".to_string(), HashMap::new()),
                ("b".to_string(), HashMap::new()),
            ]),
        );
        let limits = PoolConfig {
            max_total_instances: 10,
            max_instances_per_user: 1,
            ..Default::default()
        };
        let pool = UserMcpPool::new(
            limits,
            vec![
                McpCatalogEntry {
                    name: "a".into(),
                    command: "a-mcp".into(),
                    ..Default::default()
                },
                McpCatalogEntry {
                    name: "b".into(),
                    command: "b-mcp".into(),
                    ..Default::default()
                },
            ],
            Arc::new(StaticCredentials::new(users)),
        );

        let err = pool.spawn_for_user(u).await.unwrap_err();
        assert!(matches!(err, Error::UserQuotaExceeded));
        // Nothing reserved after a rejected admission.
        let (total, _) = pool.counts().await;
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn spawn_without_credentials_is_a_noop() {
        let pool = UserMcpPool::new(
            PoolConfig::default(),
            vec![McpCatalogEntry {
                name: "jira".into(),
                command: "jira-mcp".into(),
                ..Default::default()
            }],
            Arc::new(StaticCredentials::default()),
        );
        let started = pool.spawn_for_user(Uuid::new_v4()).await.unwrap();
        assert_eq!(started, 0);
    }

    #[tokio::test]
    async fn idle_instances_are_reaped() {
        let limits = PoolConfig {
            idle_timeout_seconds: 600,
            ..Default::default()
        };
        let pool = UserMcpPool::new(limits, Vec::new(), Arc::new(StaticCredentials::default()));
        let user = Uuid::new_v4();
        pool.insert_for_test(
            user,
            "jira",
            ready_connection("jira", vec!["t"], echo_reply()),
            Utc::now() - chrono::Duration::seconds(700),
            false,
        )
        .await;

        pool.reap_tick(Utc::now()).await;
        assert!(!pool.has_active_instances(user).await);
    }

    #[tokio::test]
    async fn stale_instances_reaped_early_fresh_ones_kept() {
        let limits = PoolConfig {
            idle_timeout_seconds: 600,
            reap_interval_seconds: 60,
            ..Default::default()
        };
        let pool = UserMcpPool::new(limits, Vec::new(), Arc::new(StaticCredentials::default()));
        let user = Uuid::new_v4();
        // Stale and quiet for 2 minutes: reaped.
        pool.insert_for_test(
            user,
            "old",
            ready_connection("old", vec!["t"], echo_reply()),
            Utc::now() - chrono::Duration::seconds(120),
            true,
        )
        .await;
        // Fresh and recently used: kept.
        pool.insert_for_test(
            user,
            "new",
            ready_connection("new", vec!["t"], echo_reply()),
            Utc::now(),
            false,
        )
        .await;

        pool.reap_tick(Utc::now()).await;
        let catalog = pool.get_tool_catalog(user).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "new.t");
    }

    #[tokio::test]
    async fn config_drift_marks_instances_stale() {
        let entry = McpCatalogEntry {
            name: "jira".into(),
            command: "jira-mcp".into(),
            ..Default::default()
        };
        let pool = UserMcpPool::new(
            PoolConfig {
                reap_interval_seconds: 0,
                ..Default::default()
            },
            vec![entry.clone()],
            Arc::new(StaticCredentials::default()),
        );
        let user = Uuid::new_v4();
        // The mock connection's fingerprint is computed from a "mock"
        // command, so any real entry counts as drift.
        pool.insert_for_test(
            user,
            "jira",
            ready_connection("jira", vec!["t"], echo_reply()),
            Utc::now(),
            false,
        )
        .await;

        let mut changed = entry;
        changed.args.push("--v2".into());
        pool.update_configs(vec![changed]);

        // Stale + reap_interval 0 → reaped on the next tick.
        pool.reap_tick(Utc::now()).await;
        assert!(!pool.has_active_instances(user).await);
    }
}
