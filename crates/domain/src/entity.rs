//! Core entity records persisted through the session repository.
//!
//! These are storage-shape-agnostic: the repository trait in `amb-sessions`
//! reads and writes them; how a backing store lays them out is its own
//! concern.

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub display_name: String,
    pub status: UserStatus,
    /// Where the account came from (`"seed"`, `"admin"`, an IdP name, …).
    #[serde(default)]
    pub auth_source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
    Deactivated,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preshared keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A long-lived preshared key bound to one user and one profile.
///
/// Only the prefix (lookup hint) and a salted keyed hash of the raw key are
/// stored; the plaintext is shown once at creation and never again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresharedKey {
    pub key_id: Uuid,
    /// First 8 chars of the base64url body after the `amb_pk_` label.
    /// Lookup hint only — authentication always verifies `key_hash`.
    pub key_prefix: String,
    /// Per-key random salt, hex-encoded.
    pub key_salt: String,
    /// HMAC-SHA256(salt, raw key), hex-encoded.
    pub key_hash: String,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Suspended,
    Revoked,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A short-lived session minted from a preshared key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    /// HMAC-SHA256(hmac_secret, nonce ∥ session_id), hex-encoded.
    pub token_hash: String,
    /// 32 random bytes, hex-encoded. Half of the client-held token.
    pub token_nonce: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub idle_timeout_s: u64,
    pub spindown_delay_s: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    SpinningDown,
    Suspended,
    Expired,
}

impl SessionStatus {
    /// States the lifecycle evaluator still walks forward.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Idle | Self::SpinningDown)
    }

    /// `expired` is terminal: no transition out.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session connections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One connected host tool (IDE, CLI) under a session. A session may have
/// several; all terminate when the session expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConnection {
    pub connection_id: Uuid,
    pub session_id: Uuid,
    pub friendly_name: String,
    pub host_tool: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named bundle of tool allow/deny globs, rate limits, and conditional
/// access rules. Profiles may inherit from one parent; the chain is a DAG
/// with depth ≤ 5, cycle-checked on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProfile {
    pub profile_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    /// Environments this profile is valid in (empty = unrestricted).
    #[serde(default)]
    pub environment_scope: Vec<String>,
    /// UTC access windows (empty = always).
    #[serde(default)]
    pub time_restrictions: Vec<TimeWindow>,
    #[serde(default)]
    pub inherited_from: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub calls_per_minute: Option<u32>,
    #[serde(default)]
    pub calls_per_hour: Option<u32>,
}

/// A recurring UTC access window. `days` empty means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Whether `at` (UTC) falls inside this window. Windows where
    /// `end < start` wrap around midnight.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        let t = NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second())
            .unwrap_or(self.start);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The authenticated identity attached to a request after token
/// verification. Everything downstream of authentication works from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    #[serde(default)]
    pub client_id: Option<String>,
    pub source_ip: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}
