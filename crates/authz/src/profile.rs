//! Effective-profile resolution.
//!
//! A profile's effective rule set is its ancestors' rules merged with its
//! own, child rules taking precedence. The `inherited_from` walk is
//! iterative with a visited set; chains longer than [`MAX_DEPTH`] or
//! containing a cycle are rejected.

use std::collections::HashSet;

use uuid::Uuid;

use amb_domain::entity::{RateLimits, TimeWindow, ToolProfile};
use amb_domain::error::{Error, Result};

use crate::glob::ToolGlobSet;

/// Maximum number of profiles in one inheritance chain (child included).
pub const MAX_DEPTH: usize = 5;

/// Source of profile records for resolution. The repository implements it;
/// tests use a plain map.
pub trait ProfileLookup {
    fn profile(&self, id: Uuid) -> Option<ToolProfile>;
}

impl ProfileLookup for std::collections::HashMap<Uuid, ToolProfile> {
    fn profile(&self, id: Uuid) -> Option<ToolProfile> {
        self.get(&id).cloned()
    }
}

/// The flattened result of walking a profile's inheritance chain, with the
/// glob sets pre-compiled for decision time.
#[derive(Debug)]
pub struct EffectiveProfile {
    pub profile_id: Uuid,
    pub name: String,
    pub allowed: ToolGlobSet,
    pub denied: ToolGlobSet,
    pub rate_limits: RateLimits,
    pub environment_scope: Vec<String>,
    pub time_restrictions: Vec<TimeWindow>,
}

/// Walk the chain from `profile_id` to its root and merge:
/// - `allowed_tools` / `denied_tools`: union across the chain,
/// - `rate_limits`: child wins per field,
/// - `environment_scope` / `time_restrictions`: child wins when set,
///   otherwise nearest ancestor.
pub fn resolve_effective_profile(
    lookup: &dyn ProfileLookup,
    profile_id: Uuid,
) -> Result<EffectiveProfile> {
    // Chain, child first.
    let mut chain: Vec<ToolProfile> = Vec::new();
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut cursor = Some(profile_id);

    while let Some(id) = cursor {
        if !visited.insert(id) {
            return Err(Error::ProfileCycle);
        }
        if chain.len() >= MAX_DEPTH {
            return Err(Error::ProfileDepthExceeded);
        }
        let profile = lookup
            .profile(id)
            .ok_or_else(|| Error::NotFound(format!("profile {id}")))?;
        cursor = profile.inherited_from;
        chain.push(profile);
    }

    let child = &chain[0];
    let mut allowed: Vec<String> = Vec::new();
    let mut denied: Vec<String> = Vec::new();
    // Ancestors first so child rules land last (ordering is cosmetic for a
    // union, but keeps matched-pattern reporting predictable).
    for profile in chain.iter().rev() {
        for rule in &profile.allowed_tools {
            if !allowed.contains(rule) {
                allowed.push(rule.clone());
            }
        }
        for rule in &profile.denied_tools {
            if !denied.contains(rule) {
                denied.push(rule.clone());
            }
        }
    }

    // Child-wins fields: nearest profile in the chain that sets them.
    let mut rate_limits = RateLimits::default();
    for profile in chain.iter().rev() {
        if profile.rate_limits.calls_per_minute.is_some() {
            rate_limits.calls_per_minute = profile.rate_limits.calls_per_minute;
        }
        if profile.rate_limits.calls_per_hour.is_some() {
            rate_limits.calls_per_hour = profile.rate_limits.calls_per_hour;
        }
    }
    let environment_scope = chain
        .iter()
        .find(|p| !p.environment_scope.is_empty())
        .map(|p| p.environment_scope.clone())
        .unwrap_or_default();
    let time_restrictions = chain
        .iter()
        .find(|p| !p.time_restrictions.is_empty())
        .map(|p| p.time_restrictions.clone())
        .unwrap_or_default();

    Ok(EffectiveProfile {
        profile_id: child.profile_id,
        name: child.name.clone(),
        allowed: ToolGlobSet::compile(&allowed)?,
        denied: ToolGlobSet::compile(&denied)?,
        rate_limits,
        environment_scope,
        time_restrictions,
    })
}

/// Write-time guard: would setting `profile_id.inherited_from = new_parent`
/// produce a cycle or an over-deep chain? Call before persisting.
pub fn check_inheritance(
    lookup: &dyn ProfileLookup,
    profile_id: Uuid,
    new_parent: Option<Uuid>,
) -> Result<()> {
    let mut visited: HashSet<Uuid> = HashSet::new();
    visited.insert(profile_id);
    let mut depth = 1usize;
    let mut cursor = new_parent;
    while let Some(id) = cursor {
        if !visited.insert(id) {
            return Err(Error::ProfileCycle);
        }
        depth += 1;
        if depth > MAX_DEPTH {
            return Err(Error::ProfileDepthExceeded);
        }
        let profile = lookup
            .profile(id)
            .ok_or_else(|| Error::NotFound(format!("profile {id}")))?;
        cursor = profile.inherited_from;
    }
    Ok(())
}
