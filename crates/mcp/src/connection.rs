//! One downstream MCP connection: transport ownership, the initialize
//! handshake, the cached tool catalog, and the lifecycle state machine
//! `new → starting → ready → failed|stopping → stopped`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use amb_domain::config::{McpCatalogEntry, McpTransportKind};
use amb_domain::error::{Error, Result};

use crate::protocol::{self, sanitize_catalog, ToolCallResult, ToolDescriptor, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state of a [`DownstreamConnection`]. `Ready` is the only state
/// in which `call` is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Starting = 1,
    Ready = 2,
    Failed = 3,
    Stopping = 4,
    Stopped = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Failed,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DownstreamConnection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single MCP connection. Spawned or dialed by `start()`, after which the
/// cached catalog and `call()` are available until `stop()`.
pub struct DownstreamConnection {
    name: String,
    config: McpCatalogEntry,
    fingerprint: String,
    status: AtomicU8,
    transport: parking_lot::RwLock<Option<Arc<dyn McpTransport>>>,
    tools: parking_lot::RwLock<Vec<ToolDescriptor>>,
}

impl DownstreamConnection {
    pub fn new(config: McpCatalogEntry) -> Self {
        let fingerprint = config_fingerprint(&config);
        Self {
            name: config.name.clone(),
            config,
            fingerprint,
            status: AtomicU8::new(ConnectionState::New as u8),
            transport: parking_lot::RwLock::new(None),
            tools: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Canonical hash of the config this connection was built from. Managers
    /// compare it against the desired config's hash to detect drift.
    pub fn config_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Spawn the subprocess (or dial the endpoint), run the MCP handshake,
    /// and cache the tool catalog. Valid only from the `New` state.
    pub async fn start(&self, extra_env: &HashMap<String, String>) -> Result<()> {
        if self
            .status
            .compare_exchange(
                ConnectionState::New as u8,
                ConnectionState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::Conflict(format!(
                "MCP connection {} already started",
                self.name
            )));
        }

        match self.start_inner(extra_env).await {
            Ok(()) => {
                self.status
                    .store(ConnectionState::Ready as u8, Ordering::SeqCst);
                tracing::info!(
                    mcp = %self.name,
                    tools = self.tools.read().len(),
                    "MCP connection ready"
                );
                Ok(())
            }
            Err(e) => {
                self.status
                    .store(ConnectionState::Failed as u8, Ordering::SeqCst);
                let transport = self.transport.read().clone();
                if let Some(t) = transport {
                    t.shutdown().await;
                }
                tracing::warn!(mcp = %self.name, error = %e, "MCP connection failed to start");
                Err(e)
            }
        }
    }

    async fn start_inner(&self, extra_env: &HashMap<String, String>) -> Result<()> {
        let transport: Arc<dyn McpTransport> = match self.config.transport {
            McpTransportKind::Stdio => Arc::new(
                StdioTransport::spawn(&self.config, extra_env)
                    .map_err(|e| self.map_transport_err(e))?,
            ),
            McpTransportKind::Http => {
                let url = self.config.url.as_deref().ok_or_else(|| {
                    Error::Config(format!("MCP {} has no url configured", self.name))
                })?;
                Arc::new(HttpTransport::connect(url).map_err(|e| self.map_transport_err(e))?)
            }
        };
        *self.transport.write() = Some(transport.clone());

        let start_timeout = Duration::from_secs(self.config.start_timeout_seconds);

        // Step 1: `initialize` handshake.
        let init_params = serde_json::to_value(protocol::initialize_params())?;
        let resp = transport
            .request("initialize", Some(init_params), start_timeout)
            .await
            .map_err(|e| self.map_transport_err(e))?;
        if let Some(err) = resp.error {
            return Err(Error::Downstream(format!(
                "{}: initialize failed: {err}",
                self.name
            )));
        }
        tracing::debug!(mcp = %self.name, "MCP initialize response received");

        // Step 2: `notifications/initialized`.
        transport
            .notify("notifications/initialized")
            .await
            .map_err(|e| self.map_transport_err(e))?;

        // Step 3: discover tools.
        let tools_resp = transport
            .request("tools/list", None, start_timeout)
            .await
            .map_err(|e| self.map_transport_err(e))?;
        let tools = match tools_resp.into_result() {
            Ok(result) => match serde_json::from_value::<ToolsListResult>(result) {
                Ok(r) => r.tools,
                Err(e) => {
                    return Err(Error::Downstream(format!(
                        "{}: failed to parse tools/list result: {e}",
                        self.name
                    )))
                }
            },
            Err(err) => {
                tracing::warn!(
                    mcp = %self.name,
                    error = %err,
                    "tools/list returned error, connection will expose no tools"
                );
                Vec::new()
            }
        };

        let mut tools = sanitize_catalog(&self.name, tools);
        for t in &mut tools {
            t.source_mcp = self.name.clone();
        }
        *self.tools.write() = tools;
        Ok(())
    }

    /// Call a tool on this connection. Accepted only in the `Ready` state;
    /// every other state returns `connection_not_ready`.
    pub async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult> {
        if self.state() != ConnectionState::Ready {
            return Err(Error::ConnectionNotReady(self.name.clone()));
        }
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| Error::ConnectionNotReady(self.name.clone()))?;

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let timeout = Duration::from_secs(self.config.call_timeout_seconds);

        let resp = transport
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| {
                if matches!(e, TransportError::ProcessExited) {
                    self.status
                        .store(ConnectionState::Failed as u8, Ordering::SeqCst);
                }
                self.map_transport_err(e)
            })?;

        let result = resp
            .into_result()
            .map_err(|err| Error::Downstream(format!("{}: tools/call failed: {err}", self.name)))?;
        serde_json::from_value::<ToolCallResult>(result).map_err(|e| {
            Error::Downstream(format!(
                "{}: failed to parse tools/call result: {e}",
                self.name
            ))
        })
    }

    /// Return the cached catalog from `start()`.
    pub fn get_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.read().iter().any(|t| t.name == tool_name)
    }

    /// Cheap liveness probe. A JSON-RPC-level error still proves the
    /// transport works; only a transport failure counts as dead.
    pub async fn ping(&self) -> bool {
        if self.state() != ConnectionState::Ready {
            return false;
        }
        let transport = match self.transport.read().clone() {
            Some(t) => t,
            None => return false,
        };
        if !transport.is_alive() {
            return false;
        }
        transport
            .request("ping", None, Duration::from_secs(5))
            .await
            .is_ok()
    }

    /// Best-effort graceful shutdown. Idempotent.
    pub async fn stop(&self) {
        let prev = self
            .status
            .swap(ConnectionState::Stopping as u8, Ordering::SeqCst);
        if prev == ConnectionState::Stopped as u8 {
            self.status
                .store(ConnectionState::Stopped as u8, Ordering::SeqCst);
            return;
        }
        let transport = self.transport.read().clone();
        if let Some(t) = transport {
            t.shutdown().await;
        }
        self.status
            .store(ConnectionState::Stopped as u8, Ordering::SeqCst);
        tracing::debug!(mcp = %self.name, "MCP connection stopped");
    }

    fn map_transport_err(&self, e: TransportError) -> Error {
        match e {
            TransportError::Timeout => {
                Error::DownstreamTimeout(format!("MCP {}", self.name))
            }
            TransportError::ProcessExited => {
                Error::Downstream(format!("MCP {} process crashed", self.name))
            }
            TransportError::Http(msg) => {
                Error::Downstream(format!("MCP {} unreachable: {msg}", self.name))
            }
            TransportError::InvalidResponse(msg) => {
                Error::Downstream(format!("MCP {} invalid response: {msg}", self.name))
            }
            TransportError::EnvRejected(name) => {
                Error::Config(format!("MCP {}: env var {name} is deny-listed", self.name))
            }
            TransportError::Io(e) => {
                Error::Downstream(format!("MCP {} I/O failure: {e}", self.name))
            }
            TransportError::Json(e) => {
                Error::Downstream(format!("MCP {} serialization failure: {e}", self.name))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config fingerprinting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Canonical hash over the routable parts of an MCP config. Env **keys**
/// participate; env values do not (credential rotation must not look like
/// config drift).
pub fn config_fingerprint(config: &McpCatalogEntry) -> String {
    let mut env_keys: Vec<&str> = config.env.keys().map(String::as_str).collect();
    env_keys.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(config.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(format!("{:?}", config.transport).as_bytes());
    hasher.update([0u8]);
    hasher.update(config.command.as_bytes());
    hasher.update([0u8]);
    for arg in &config.args {
        hasher.update(arg.as_bytes());
        hasher.update([1u8]);
    }
    hasher.update([0u8]);
    hasher.update(config.url.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    for key in env_keys {
        hasher.update(key.as_bytes());
        hasher.update([1u8]);
    }
    hasher.update([0u8]);
    hasher.update(format!("{:?}", config.isolation).as_bytes());
    hasher.update([0u8]);
    hasher.update(config.call_timeout_seconds.to_le_bytes());
    hasher.update(config.start_timeout_seconds.to_le_bytes());
    hex::encode(hasher.finalize())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test support
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A scriptable in-memory transport for connection-level tests.
    pub struct MockTransport {
        pub alive: AtomicU8,
        pub reply: parking_lot::Mutex<Option<Value>>,
        pub fail_with: parking_lot::Mutex<Option<String>>,
    }

    impl MockTransport {
        pub fn replying(reply: Value) -> Self {
            Self {
                alive: AtomicU8::new(1),
                reply: parking_lot::Mutex::new(Some(reply)),
                fail_with: parking_lot::Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl McpTransport for MockTransport {
        async fn request(
            &self,
            _method: &str,
            _params: Option<Value>,
            _timeout: Duration,
        ) -> std::result::Result<crate::protocol::JsonRpcResponse, TransportError> {
            if let Some(msg) = self.fail_with.lock().clone() {
                return Err(TransportError::Http(msg));
            }
            Ok(crate::protocol::JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: 0,
                result: self.reply.lock().clone(),
                error: None,
            })
        }

        async fn notify(&self, _method: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst) == 1
        }

        async fn shutdown(&self) {
            self.alive.store(0, Ordering::SeqCst);
        }
    }

    /// Build a connection that is already `Ready` with the given catalog,
    /// backed by a mock transport.
    pub fn ready_connection(
        name: &str,
        tools: Vec<&str>,
        reply: Value,
    ) -> Arc<DownstreamConnection> {
        let config = McpCatalogEntry {
            name: name.into(),
            command: "mock".into(),
            ..Default::default()
        };
        let conn = DownstreamConnection::new(config);
        *conn.transport.write() = Some(Arc::new(MockTransport::replying(reply)));
        *conn.tools.write() = tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.into(),
                description: String::new(),
                input_schema: serde_json::json!({}),
                source_mcp: name.into(),
            })
            .collect();
        conn.status
            .store(ConnectionState::Ready as u8, Ordering::SeqCst);
        Arc::new(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ready_connection;
    use super::*;

    fn entry(name: &str) -> McpCatalogEntry {
        McpCatalogEntry {
            name: name.into(),
            command: "demo-mcp".into(),
            args: vec!["--stdio".into()],
            ..Default::default()
        }
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = entry("demo");
        let mut b = entry("demo");
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));

        b.args.push("--verbose".into());
        assert_ne!(config_fingerprint(&a), config_fingerprint(&b));
    }

    #[test]
    fn fingerprint_ignores_env_values() {
        let mut a = entry("demo");
        a.env.insert("TOKEN".into(), "one".into());
        let mut b = entry("demo");
        b.env.insert("TOKEN".into(), "two".into());
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));

        b.env.insert("EXTRA".into(), "x".into());
        assert_ne!(config_fingerprint(&a), config_fingerprint(&b));
    }

    #[tokio::test]
    async fn call_rejected_before_start() {
        let conn = DownstreamConnection::new(entry("demo"));
        assert_eq!(conn.state(), ConnectionState::New);
        let err = conn
            .call("demo.echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionNotReady(_)));
    }

    #[tokio::test]
    async fn call_rejected_after_stop() {
        let conn = ready_connection("demo", vec!["demo.echo"], serde_json::json!({}));
        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
        let err = conn
            .call("demo.echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionNotReady(_)));
    }

    #[tokio::test]
    async fn ready_connection_round_trips_a_call() {
        let conn = ready_connection(
            "demo",
            vec!["demo.echo"],
            serde_json::json!({
                "content": [{ "type": "text", "text": "{\"x\":1}" }]
            }),
        );
        let result = conn
            .call("demo.echo", serde_json::json!({ "x": 1 }))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content[0].text, "{\"x\":1}");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let conn = ready_connection("demo", vec![], serde_json::json!({}));
        conn.stop().await;
        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[test]
    fn catalog_is_namespace_stamped() {
        let conn = ready_connection("demo", vec!["demo.echo"], serde_json::json!({}));
        let tools = conn.get_tools();
        assert_eq!(tools[0].source_mcp, "demo");
        assert!(conn.has_tool("demo.echo"));
        assert!(!conn.has_tool("other"));
    }
}
