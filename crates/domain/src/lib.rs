//! `amb-domain` — shared types for the MCP Ambassador gateway.
//!
//! This crate holds the pieces every other crate depends on:
//! - the shared [`error::Error`] taxonomy,
//! - typed configuration with startup validation,
//! - the core entity records (users, preshared keys, sessions, connections,
//!   tool profiles).

pub mod config;
pub mod entity;
pub mod error;
