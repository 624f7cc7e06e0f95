//! `amb-sessions` — session lifecycle engine for the Ambassador gateway.
//!
//! This crate provides:
//! - the [`SessionRepository`] storage seam plus the in-memory/JSON-snapshot
//!   implementation the gateway runs on,
//! - preshared-key format, hashing, and constant-time verification,
//! - HMAC session tokens (mint, verify, rotate),
//! - the [`EphemeralAuthProvider`] (register → authenticate → heartbeat →
//!   rotate),
//! - the [`SessionLifecycleManager`] evaluator and sweeper.

pub mod auth;
pub mod keys;
pub mod lifecycle;
pub mod ratelimit;
pub mod repository;
pub mod token;

pub use auth::{EphemeralAuthProvider, HeartbeatOutcome, RegisteredSession};
pub use lifecycle::{PoolHandle, SessionLifecycleManager};
pub use repository::{MemoryRepository, SessionRepository};
pub use token::HmacSecret;
