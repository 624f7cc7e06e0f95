//! Shared MCP manager — the pool of process-wide MCP connections serving
//! every user, with an aggregated catalog and fingerprint-based reconcile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use amb_domain::config::McpCatalogEntry;
use amb_domain::error::{Error, Result};

use crate::connection::{config_fingerprint, ConnectionState, DownstreamConnection};
use crate::protocol::{ToolCallResult, ToolDescriptor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SharedMcpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Manager for `isolation_mode = shared` catalog entries.
///
/// Connections are keyed by MCP name in a `BTreeMap`, which gives the stable
/// name ordering the first-wins catalog merge relies on.
pub struct SharedMcpManager {
    connections: tokio::sync::RwLock<BTreeMap<String, Arc<DownstreamConnection>>>,
    /// Single-flight guard: only one reconcile may run at a time.
    reconcile_lock: tokio::sync::Mutex<()>,
}

/// Outcome of a reconcile pass.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Entries whose replacement connection failed to start.
    pub failed: Vec<String>,
}

impl Default for SharedMcpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMcpManager {
    pub fn new() -> Self {
        Self {
            connections: tokio::sync::RwLock::new(BTreeMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start all configured shared MCPs in parallel. Entries that fail to
    /// start are logged and skipped (not fatal): the gateway serves whatever
    /// catalog it could assemble.
    pub async fn initialize(&self, configs: Vec<McpCatalogEntry>) {
        let no_env = HashMap::new();
        let starts = configs.into_iter().map(|entry| {
            let no_env = &no_env;
            async move {
                let conn = Arc::new(DownstreamConnection::new(entry));
                match conn.start(no_env).await {
                    Ok(()) => Some(conn),
                    Err(e) => {
                        tracing::warn!(
                            mcp = %conn.name(),
                            error = %e,
                            "failed to initialize shared MCP, skipping"
                        );
                        None
                    }
                }
            }
        });

        let started: Vec<_> = futures_util::future::join_all(starts).await;
        let mut connections = self.connections.write().await;
        for conn in started.into_iter().flatten() {
            connections.insert(conn.name().to_owned(), conn);
        }
        if !connections.is_empty() {
            tracing::info!(count = connections.len(), "shared MCP manager ready");
        }
    }

    /// Merged, de-duplicated catalog across all ready connections. On a tool
    /// name collision the connection that sorts first by MCP name wins; the
    /// loser is suppressed and logged.
    pub async fn get_tool_catalog(&self) -> Vec<ToolDescriptor> {
        let connections = self.connections.read().await;
        let mut seen: HashSet<String> = HashSet::new();
        let mut catalog = Vec::new();
        for conn in connections.values() {
            if conn.state() != ConnectionState::Ready {
                continue;
            }
            for tool in conn.get_tools() {
                if seen.insert(tool.name.clone()) {
                    catalog.push(tool);
                } else {
                    tracing::warn!(
                        mcp = %conn.name(),
                        tool = %tool.name,
                        "suppressing colliding tool name (first MCP wins)"
                    );
                }
            }
        }
        catalog
    }

    /// Dispatch a call to the connection that owns `tool_name`.
    pub async fn invoke_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult> {
        let conn = self
            .find_connection(tool_name)
            .await
            .ok_or_else(|| Error::ToolNotFound(tool_name.to_owned()))?;
        conn.call(tool_name, arguments).await
    }

    /// The connection owning `tool_name`, honoring first-wins ordering.
    pub async fn find_connection(&self, tool_name: &str) -> Option<Arc<DownstreamConnection>> {
        let connections = self.connections.read().await;
        connections
            .values()
            .find(|c| c.state() == ConnectionState::Ready && c.has_tool(tool_name))
            .cloned()
    }

    /// `name → fingerprint` for every running connection, used by callers to
    /// compute reconcile diffs.
    pub async fn running_fingerprints(&self) -> HashMap<String, String> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .map(|(name, conn)| (name.clone(), conn.config_fingerprint().to_owned()))
            .collect()
    }

    pub async fn server_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn tool_count(&self) -> usize {
        self.get_tool_catalog().await.len()
    }

    /// Reconcile the running set against `desired`: start new entries, stop
    /// removed ones, and restart entries whose fingerprint changed (old
    /// connection stops before the new one starts). Only one reconcile may
    /// run at a time; a concurrent attempt fails fast with `reload_conflict`.
    pub async fn apply_changes(&self, desired: Vec<McpCatalogEntry>) -> Result<ReconcileReport> {
        let _guard = self
            .reconcile_lock
            .try_lock()
            .map_err(|_| Error::ReloadConflict)?;

        let mut report = ReconcileReport::default();
        let running = self.running_fingerprints().await;
        let desired_names: HashSet<&str> = desired.iter().map(|e| e.name.as_str()).collect();

        // to_remove: running entries absent from the desired set.
        let to_remove: Vec<String> = running
            .keys()
            .filter(|name| !desired_names.contains(name.as_str()))
            .cloned()
            .collect();
        for name in to_remove {
            self.stop_and_remove(&name).await;
            report.removed.push(name);
        }

        // to_add / to_update, split by fingerprint.
        let no_env = HashMap::new();
        for entry in desired {
            let name = entry.name.clone();
            match running.get(&name) {
                Some(fp) if *fp == config_fingerprint(&entry) => continue,
                Some(_) => {
                    // Config drift: stop the old connection before starting
                    // the replacement.
                    self.stop_and_remove(&name).await;
                    if self.start_and_insert(entry, &no_env).await {
                        report.updated.push(name);
                    } else {
                        report.failed.push(name);
                    }
                }
                None => {
                    if self.start_and_insert(entry, &no_env).await {
                        report.added.push(name);
                    } else {
                        report.failed.push(name);
                    }
                }
            }
        }

        tracing::info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "shared MCP reconcile applied"
        );
        Ok(report)
    }

    /// Reconcile a single entry in (add or update).
    pub async fn upsert_mcp(&self, entry: McpCatalogEntry) -> Result<()> {
        let _guard = self
            .reconcile_lock
            .try_lock()
            .map_err(|_| Error::ReloadConflict)?;
        let name = entry.name.clone();
        let running = self.running_fingerprints().await;
        if running.get(&name) == Some(&config_fingerprint(&entry)) {
            return Ok(());
        }
        if running.contains_key(&name) {
            self.stop_and_remove(&name).await;
        }
        if self.start_and_insert(entry, &HashMap::new()).await {
            Ok(())
        } else {
            Err(Error::Downstream(format!("MCP {name} failed to start")))
        }
    }

    /// Reconcile a single entry out.
    pub async fn remove_mcp(&self, name: &str) -> Result<()> {
        let _guard = self
            .reconcile_lock
            .try_lock()
            .map_err(|_| Error::ReloadConflict)?;
        if !self.connections.read().await.contains_key(name) {
            return Err(Error::NotFound(format!("MCP {name}")));
        }
        self.stop_and_remove(name).await;
        Ok(())
    }

    /// Stop all connections concurrently.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = {
            let mut map = self.connections.write().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        let stops: Vec<_> = connections.iter().map(|c| c.stop()).collect();
        futures_util::future::join_all(stops).await;
    }

    async fn stop_and_remove(&self, name: &str) {
        let conn = self.connections.write().await.remove(name);
        if let Some(conn) = conn {
            conn.stop().await;
        }
    }

    async fn start_and_insert(
        &self,
        entry: McpCatalogEntry,
        env: &HashMap<String, String>,
    ) -> bool {
        let conn = Arc::new(DownstreamConnection::new(entry));
        match conn.start(env).await {
            Ok(()) => {
                self.connections
                    .write()
                    .await
                    .insert(conn.name().to_owned(), conn);
                true
            }
            Err(e) => {
                tracing::warn!(mcp = %conn.name(), error = %e, "MCP failed to start during reconcile");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, conn: Arc<DownstreamConnection>) {
        self.connections
            .write()
            .await
            .insert(conn.name().to_owned(), conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ready_connection;

    fn echo_reply() -> Value {
        serde_json::json!({ "content": [{ "type": "text", "text": "ok" }] })
    }

    #[tokio::test]
    async fn catalog_merges_with_first_wins() {
        let mgr = SharedMcpManager::new();
        // "alpha" sorts before "beta": alpha's duplicate wins.
        mgr.insert_for_test(ready_connection(
            "beta",
            vec!["shared.tool", "beta.only"],
            echo_reply(),
        ))
        .await;
        mgr.insert_for_test(ready_connection(
            "alpha",
            vec!["shared.tool", "alpha.only"],
            echo_reply(),
        ))
        .await;

        let catalog = mgr.get_tool_catalog().await;
        let shared = catalog.iter().find(|t| t.name == "shared.tool").unwrap();
        assert_eq!(shared.source_mcp, "alpha");
        assert_eq!(catalog.len(), 3);
    }

    #[tokio::test]
    async fn invoke_routes_to_owner() {
        let mgr = SharedMcpManager::new();
        mgr.insert_for_test(ready_connection("demo", vec!["demo.echo"], echo_reply()))
            .await;

        let result = mgr
            .invoke_tool("demo.echo", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.content[0].text, "ok");

        let err = mgr
            .invoke_tool("missing.tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn stopped_connections_leave_the_catalog() {
        let mgr = SharedMcpManager::new();
        let conn = ready_connection("demo", vec!["demo.echo"], echo_reply());
        mgr.insert_for_test(conn.clone()).await;
        assert_eq!(mgr.tool_count().await, 1);

        conn.stop().await;
        assert_eq!(mgr.tool_count().await, 0);
        assert!(mgr.find_connection("demo.echo").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_reconcile_fails_fast() {
        let mgr = Arc::new(SharedMcpManager::new());
        let _held = mgr.reconcile_lock.lock().await;
        let err = mgr.apply_changes(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::ReloadConflict));
    }

    #[tokio::test]
    async fn reconcile_removes_absent_entries() {
        let mgr = SharedMcpManager::new();
        mgr.insert_for_test(ready_connection("old", vec!["old.tool"], echo_reply()))
            .await;

        let report = mgr.apply_changes(Vec::new()).await.unwrap();
        assert_eq!(report.removed, vec!["old".to_string()]);
        assert_eq!(mgr.server_count().await, 0);
    }

    #[tokio::test]
    async fn fingerprints_reported_per_name() {
        let mgr = SharedMcpManager::new();
        mgr.insert_for_test(ready_connection("demo", vec![], echo_reply()))
            .await;
        let fps = mgr.running_fingerprints().await;
        assert_eq!(fps.len(), 1);
        assert!(fps.contains_key("demo"));
    }
}
