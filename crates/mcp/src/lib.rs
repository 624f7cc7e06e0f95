//! `amb-mcp` — downstream MCP connection layer for the Ambassador gateway.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for talking to MCP servers.
//! - Stdio and HTTP transports with correlation-id request matching.
//! - [`DownstreamConnection`]: one MCP's transport, handshake, cached tool
//!   catalog, and lifecycle state machine.
//! - [`SharedMcpManager`]: the pool of process-wide shared MCPs with an
//!   aggregated catalog and fingerprint-based reconcile.
//! - [`UserMcpPool`]: per-user MCP instances under global and per-user caps.
//! - [`ToolRouter`]: resolves a tool name to the connection that owns it.

pub mod connection;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod shared;
pub mod transport;

// Re-exports for convenience.
pub use connection::{ConnectionState, DownstreamConnection};
pub use pool::{CredentialSource, StaticCredentials, UserMcpPool};
pub use protocol::{ToolCallResult, ToolDescriptor};
pub use router::{RouteTarget, ToolRouter};
pub use shared::{ReconcileReport, SharedMcpManager};
