//! MCP transport layer.
//!
//! Each downstream MCP communicates over a transport:
//! - **Stdio**: spawn a child process, newline-delimited JSON-RPC over
//!   stdin/stdout. A dedicated reader task matches responses to in-flight
//!   requests by correlation id, so concurrent calls on one connection are
//!   fine.
//! - **Http**: JSON-RPC over HTTP POST. Servers may answer with a plain JSON
//!   body or an SSE body whose first `data:` line carries the response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use amb_domain::config::McpCatalogEntry;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Trait for MCP transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait up to `timeout` for the matching
    /// response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Shut down the transport gracefully.
    async fn shutdown(&self);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("invalid response from MCP: {0}")]
    InvalidResponse(String),

    #[error("environment variable rejected by deny-list: {0}")]
    EnvRejected(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env safety
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Variables a gateway-injected environment must never set: loader and
/// interpreter override knobs that would let a credential blob hijack the
/// subprocess.
const ENV_DENY_EXACT: &[&str] = &["PATH", "NODE_OPTIONS", "PYTHONPATH", "PERL5LIB"];
const ENV_DENY_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Whether a variable name may be injected into an MCP subprocess.
pub fn env_name_allowed(name: &str) -> bool {
    if ENV_DENY_EXACT.iter().any(|d| name.eq_ignore_ascii_case(d)) {
        return false;
    }
    let upper = name.to_ascii_uppercase();
    !ENV_DENY_PREFIXES.iter().any(|p| upper.starts_with(p))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to tolerate before declaring the server
/// broken (misconfigured servers that log to stdout).
const MAX_SKIP_LINES: usize = 1000;

type PendingMap = parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line. A background
/// reader task owns stdout and completes per-request `oneshot` channels
/// keyed by correlation id, so multiple requests may be in flight at once.
#[derive(Debug)]
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    /// Ephemeral working directory; removed on shutdown.
    workdir: std::path::PathBuf,
}

impl StdioTransport {
    /// Spawn a child process for the given catalog entry, layering
    /// `extra_env` (e.g. decrypted per-user credentials) over the entry's
    /// base environment. Every injected variable name is checked against
    /// the deny-list first.
    pub fn spawn(
        config: &McpCatalogEntry,
        extra_env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        for key in config.env.keys().chain(extra_env.keys()) {
            if !env_name_allowed(key) {
                return Err(TransportError::EnvRejected(key.clone()));
            }
        }

        // Each subprocess gets a throwaway working directory.
        let workdir =
            std::env::temp_dir().join(format!("amb-mcp-{}-{}", config.name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&workdir).map_err(TransportError::Io)?;

        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .current_dir(&workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in config.env.iter().chain(extra_env.iter()) {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pending: Arc<PendingMap> = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Reader task: owns stdout for the life of the process and routes
        // responses to their waiting callers.
        {
            let pending = pending.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut skipped = 0usize;
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if !trimmed.starts_with('{') {
                        skipped += 1;
                        if skipped >= MAX_SKIP_LINES {
                            tracing::warn!(
                                "MCP produced too many non-JSON lines on stdout, giving up"
                            );
                            break;
                        }
                        tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP stdout");
                        continue;
                    }
                    if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(trimmed) {
                        if let Some(tx) = pending.lock().remove(&resp.id) {
                            let _ = tx.send(resp);
                            continue;
                        }
                    }
                    // Notification or a response nobody is waiting for.
                    tracing::debug!(line = %trimmed, "skipping non-matching message from MCP stdout");
                }
                alive.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every in-flight caller with an
                // error.
                pending.lock().clear();
            });
        }

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            workdir,
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        tracing::debug!(id, method, "sending MCP request");
        if let Err(e) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(method, "sending MCP notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        // Close stdin to signal the process to exit.
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP stdin");
            }
        }
        // Give the process a moment to exit gracefully.
        let wait = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        match wait {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "MCP process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for MCP process");
            }
            Err(_) => {
                tracing::warn!("MCP process did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP process");
                }
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
            tracing::debug!(error = %e, "could not remove MCP working directory");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP transport: one JSON-RPC message per POST. Correlation is carried by
/// the HTTP exchange itself, but response ids are still checked.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn connect(url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    /// Extract a JSON-RPC response from an SSE body: the first `data:` line
    /// that parses as a response object wins.
    fn parse_sse_body(body: &str) -> Result<JsonRpcResponse, TransportError> {
        for line in body.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data.starts_with('{') {
                    if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data) {
                        return Ok(resp);
                    }
                }
            }
        }
        Err(TransportError::InvalidResponse(
            "no JSON-RPC response in SSE body".into(),
        ))
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let response = self
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(&req)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "MCP endpoint returned {status}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let resp = if content_type.starts_with("text/event-stream") {
            Self::parse_sse_body(&body)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?
        };

        if resp.id != id {
            return Err(TransportError::InvalidResponse(format!(
                "response id {} does not match request id {id}",
                resp.id
            )));
        }
        Ok(resp)
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        self.client
            .post(&self.url)
            .json(&notif)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl HttpTransport {
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
