//! Process-wide kill switches.
//!
//! Keyed by `(kind, target)`. The pipeline consults the table before
//! authorization on every call, so reads must never contend: the table is a
//! sharded concurrent map and lookups take no global lock. Writes go through
//! the admin API.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchKind {
    /// Blocks everything. Target is ignored (stored as `""`).
    Global,
    /// Blocks one tool name.
    Tool,
    /// Blocks one user id.
    User,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchEntry {
    pub kind: KillSwitchKind,
    pub target: String,
    pub engaged_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Default)]
pub struct KillSwitchTable {
    switches: DashMap<(KillSwitchKind, String), KillSwitchEntry>,
}

impl KillSwitchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self, kind: KillSwitchKind, target: &str, reason: Option<String>) {
        let target = normalize(kind, target);
        tracing::warn!(?kind, target = %target, "kill switch engaged");
        self.switches.insert(
            (kind, target.clone()),
            KillSwitchEntry {
                kind,
                target,
                engaged_at: Utc::now(),
                reason,
            },
        );
    }

    /// Returns `true` when a switch was actually released.
    pub fn release(&self, kind: KillSwitchKind, target: &str) -> bool {
        let target = normalize(kind, target);
        let released = self.switches.remove(&(kind, target.clone())).is_some();
        if released {
            tracing::warn!(?kind, target = %target, "kill switch released");
        }
        released
    }

    /// The switch blocking this call, if any. Checked global-first.
    pub fn blocking(&self, tool_name: &str, user_id: Uuid) -> Option<KillSwitchEntry> {
        for key in [
            (KillSwitchKind::Global, String::new()),
            (KillSwitchKind::Tool, tool_name.to_owned()),
            (KillSwitchKind::User, user_id.to_string()),
        ] {
            if let Some(entry) = self.switches.get(&key) {
                return Some(entry.clone());
            }
        }
        None
    }

    pub fn list(&self) -> Vec<KillSwitchEntry> {
        self.switches.iter().map(|e| e.value().clone()).collect()
    }
}

fn normalize(kind: KillSwitchKind, target: &str) -> String {
    match kind {
        KillSwitchKind::Global => String::new(),
        _ => target.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_blocks_everything() {
        let table = KillSwitchTable::new();
        assert!(table.blocking("demo.echo", Uuid::new_v4()).is_none());

        table.engage(KillSwitchKind::Global, "ignored", None);
        assert!(table.blocking("demo.echo", Uuid::new_v4()).is_some());

        assert!(table.release(KillSwitchKind::Global, ""));
        assert!(table.blocking("demo.echo", Uuid::new_v4()).is_none());
    }

    #[test]
    fn tool_switch_blocks_only_that_tool() {
        let table = KillSwitchTable::new();
        table.engage(KillSwitchKind::Tool, "fs.write_file", Some("incident".into()));
        let user = Uuid::new_v4();
        assert!(table.blocking("fs.write_file", user).is_some());
        assert!(table.blocking("fs.read_file", user).is_none());
    }

    #[test]
    fn user_switch_blocks_only_that_user() {
        let table = KillSwitchTable::new();
        let bad = Uuid::new_v4();
        table.engage(KillSwitchKind::User, &bad.to_string(), None);
        assert!(table.blocking("demo.echo", bad).is_some());
        assert!(table.blocking("demo.echo", Uuid::new_v4()).is_none());
    }

    #[test]
    fn release_of_unknown_switch_is_false() {
        let table = KillSwitchTable::new();
        assert!(!table.release(KillSwitchKind::Tool, "nope"));
    }
}
