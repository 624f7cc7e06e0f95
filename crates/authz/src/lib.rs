//! `amb-authz` — RBAC authorization for tool calls.
//!
//! Profiles bundle allow/deny tool globs plus conditional access rules and
//! may inherit from one parent (DAG, depth ≤ 5, cycle-checked). Decisions
//! are deny-wins, then default-deny, then environment and time gating.

pub mod authorizer;
pub mod glob;
pub mod profile;

pub use authorizer::{authorize, Decision};
pub use glob::ToolGlobSet;
pub use profile::{check_inheritance, resolve_effective_profile, EffectiveProfile, ProfileLookup};
