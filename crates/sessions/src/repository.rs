//! Storage seam for users, preshared keys, sessions, connections, and tool
//! profiles.
//!
//! The gateway treats storage as this repository interface. The bundled
//! [`MemoryRepository`] keeps everything in maps and can snapshot to a JSON
//! file; a SQL-backed implementation is an external concern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use amb_domain::entity::{
    ConnectionStatus, KeyStatus, PresharedKey, Session, SessionConnection, SessionStatus,
    ToolProfile, User, UserStatus,
};
use amb_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait SessionRepository: Send + Sync {
    // ── users ────────────────────────────────────────────────────────
    async fn insert_user(&self, user: User) -> Result<()>;
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn set_user_status(&self, user_id: Uuid, status: UserStatus) -> Result<()>;
    async fn list_users(&self) -> Result<Vec<User>>;

    // ── preshared keys ───────────────────────────────────────────────
    async fn insert_key(&self, key: PresharedKey) -> Result<()>;
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<PresharedKey>>;
    async fn set_key_status(&self, key_id: Uuid, status: KeyStatus) -> Result<()>;
    async fn list_keys(&self) -> Result<Vec<PresharedKey>>;

    // ── sessions ─────────────────────────────────────────────────────
    async fn insert_session(&self, session: Session) -> Result<()>;
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>>;
    /// Whole-row write keyed on `session_id`.
    async fn update_session(&self, session: Session) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    /// Sessions in a state the lifecycle evaluator still walks forward.
    async fn live_sessions(&self) -> Result<Vec<Session>>;
    async fn live_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>>;
    /// Sweeper primitive: delete `expired` rows whose last activity is older
    /// than `cutoff`. Returns how many were removed.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // ── session connections ──────────────────────────────────────────
    async fn insert_connection(&self, connection: SessionConnection) -> Result<()>;
    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<SessionConnection>>;
    async fn connections_for_session(&self, session_id: Uuid) -> Result<Vec<SessionConnection>>;
    async fn update_connection(&self, connection: SessionConnection) -> Result<()>;

    // ── tool profiles ────────────────────────────────────────────────
    async fn upsert_profile(&self, profile: ToolProfile) -> Result<()>;
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<ToolProfile>>;
    async fn get_profile_by_name(&self, name: &str) -> Result<Option<ToolProfile>>;
    async fn list_profiles(&self) -> Result<Vec<ToolProfile>>;
    async fn delete_profile(&self, profile_id: Uuid) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory repository
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    users: HashMap<Uuid, User>,
    keys: HashMap<Uuid, PresharedKey>,
    sessions: HashMap<Uuid, Session>,
    connections: HashMap<Uuid, SessionConnection>,
    profiles: HashMap<Uuid, ToolProfile>,
}

/// Map-backed repository with optional JSON snapshot persistence.
pub struct MemoryRepository {
    state: RwLock<Snapshot>,
    snapshot_path: Option<PathBuf>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// Purely in-memory (tests, ephemeral deployments).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            snapshot_path: None,
        }
    }

    /// Load or create the snapshot at `state_path/repository.json`.
    pub fn with_snapshot(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let snapshot_path = state_path.join("repository.json");
        let state = if snapshot_path.exists() {
            let raw = std::fs::read_to_string(&snapshot_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Snapshot::default()
        };

        tracing::info!(
            path = %snapshot_path.display(),
            "session repository loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(snapshot_path),
        })
    }

    /// Persist the current state to the snapshot file, if one is configured.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = {
            let state = self.state.read();
            serde_json::to_string_pretty(&*state)?
        };
        std::fs::write(path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn insert_user(&self, user: User) -> Result<()> {
        self.state.write().users.insert(user.user_id, user);
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.state.read().users.get(&user_id).cloned())
    }

    async fn set_user_status(&self, user_id: Uuid, status: UserStatus) -> Result<()> {
        let mut state = self.state.write();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        user.status = status;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.state.read().users.values().cloned().collect())
    }

    async fn insert_key(&self, key: PresharedKey) -> Result<()> {
        self.state.write().keys.insert(key.key_id, key);
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<PresharedKey>> {
        Ok(self
            .state
            .read()
            .keys
            .values()
            .filter(|k| k.key_prefix == prefix && k.status == KeyStatus::Active)
            .cloned()
            .collect())
    }

    async fn set_key_status(&self, key_id: Uuid, status: KeyStatus) -> Result<()> {
        let mut state = self.state.write();
        let key = state
            .keys
            .get_mut(&key_id)
            .ok_or_else(|| Error::NotFound(format!("key {key_id}")))?;
        key.status = status;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<PresharedKey>> {
        Ok(self.state.read().keys.values().cloned().collect())
    }

    async fn insert_session(&self, session: Session) -> Result<()> {
        self.state
            .write()
            .sessions
            .insert(session.session_id, session);
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self.state.read().sessions.get(&session_id).cloned())
    }

    async fn update_session(&self, session: Session) -> Result<()> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(&session.session_id) {
            return Err(Error::NotFound(format!("session {}", session.session_id)));
        }
        state.sessions.insert(session.session_id, session);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.state.read().sessions.values().cloned().collect())
    }

    async fn live_sessions(&self) -> Result<Vec<Session>> {
        Ok(self
            .state
            .read()
            .sessions
            .values()
            .filter(|s| s.status.is_live())
            .cloned()
            .collect())
    }

    async fn live_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        Ok(self
            .state
            .read()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.status.is_live())
            .cloned()
            .collect())
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write();
        let doomed: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Expired && s.last_activity_at < cutoff)
            .map(|s| s.session_id)
            .collect();
        for id in &doomed {
            state.sessions.remove(id);
            state.connections.retain(|_, c| c.session_id != *id);
        }
        Ok(doomed.len())
    }

    async fn insert_connection(&self, connection: SessionConnection) -> Result<()> {
        self.state
            .write()
            .connections
            .insert(connection.connection_id, connection);
        Ok(())
    }

    async fn get_connection(&self, connection_id: Uuid) -> Result<Option<SessionConnection>> {
        Ok(self.state.read().connections.get(&connection_id).cloned())
    }

    async fn connections_for_session(&self, session_id: Uuid) -> Result<Vec<SessionConnection>> {
        Ok(self
            .state
            .read()
            .connections
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn update_connection(&self, connection: SessionConnection) -> Result<()> {
        let mut state = self.state.write();
        if !state.connections.contains_key(&connection.connection_id) {
            return Err(Error::NotFound(format!(
                "connection {}",
                connection.connection_id
            )));
        }
        state.connections.insert(connection.connection_id, connection);
        Ok(())
    }

    async fn upsert_profile(&self, profile: ToolProfile) -> Result<()> {
        self.state
            .write()
            .profiles
            .insert(profile.profile_id, profile);
        Ok(())
    }

    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<ToolProfile>> {
        Ok(self.state.read().profiles.get(&profile_id).cloned())
    }

    async fn get_profile_by_name(&self, name: &str) -> Result<Option<ToolProfile>> {
        Ok(self
            .state
            .read()
            .profiles
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<ToolProfile>> {
        Ok(self.state.read().profiles.values().cloned().collect())
    }

    async fn delete_profile(&self, profile_id: Uuid) -> Result<()> {
        let mut state = self.state.write();
        // A profile that other profiles inherit from is in use.
        if state
            .profiles
            .values()
            .any(|p| p.inherited_from == Some(profile_id))
        {
            return Err(Error::Conflict(format!(
                "profile {profile_id} is inherited from"
            )));
        }
        state
            .profiles
            .remove(&profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {profile_id}")))?;
        Ok(())
    }
}

/// Mark every connection of `session_id` disconnected. Shared by HMAC
/// rotation and explicit disconnects.
pub async fn disconnect_session_connections(
    repo: &dyn SessionRepository,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut count = 0;
    for mut connection in repo.connections_for_session(session_id).await? {
        if connection.status == ConnectionStatus::Connected {
            connection.status = ConnectionStatus::Disconnected;
            connection.disconnected_at = Some(now);
            repo.update_connection(connection).await?;
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amb_domain::entity::RateLimits;

    fn user() -> User {
        User {
            user_id: Uuid::new_v4(),
            display_name: "dev".into(),
            status: UserStatus::Active,
            auth_source: "seed".into(),
            created_at: Utc::now(),
        }
    }

    fn session(user_id: Uuid, status: SessionStatus) -> Session {
        Session {
            session_id: Uuid::new_v4(),
            user_id,
            profile_id: Uuid::new_v4(),
            token_hash: String::new(),
            token_nonce: String::new(),
            status,
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            idle_timeout_s: 900,
            spindown_delay_s: 300,
        }
    }

    #[tokio::test]
    async fn keys_by_prefix_only_returns_active() {
        let repo = MemoryRepository::new();
        let u = user();
        let mut key = PresharedKey {
            key_id: Uuid::new_v4(),
            key_prefix: "AAAABBBB".into(),
            key_salt: String::new(),
            key_hash: String::new(),
            user_id: u.user_id,
            profile_id: Uuid::new_v4(),
            status: KeyStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
        };
        repo.insert_key(key.clone()).await.unwrap();
        key.key_id = Uuid::new_v4();
        key.status = KeyStatus::Revoked;
        repo.insert_key(key).await.unwrap();

        let hits = repo.keys_by_prefix("AAAABBBB").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn live_sessions_filters_terminal_states() {
        let repo = MemoryRepository::new();
        let u = user();
        repo.insert_session(session(u.user_id, SessionStatus::Active))
            .await
            .unwrap();
        repo.insert_session(session(u.user_id, SessionStatus::Idle))
            .await
            .unwrap();
        repo.insert_session(session(u.user_id, SessionStatus::Expired))
            .await
            .unwrap();

        assert_eq!(repo.live_sessions().await.unwrap().len(), 2);
        assert_eq!(
            repo.live_sessions_for_user(u.user_id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn sweeper_deletes_only_old_expired_rows() {
        let repo = MemoryRepository::new();
        let u = user();
        let mut old = session(u.user_id, SessionStatus::Expired);
        old.last_activity_at = Utc::now() - chrono::Duration::days(30);
        let recent = session(u.user_id, SessionStatus::Expired);
        let live = session(u.user_id, SessionStatus::Active);
        repo.insert_session(old.clone()).await.unwrap();
        repo.insert_session(recent).await.unwrap();
        repo.insert_session(live).await.unwrap();

        let removed = repo
            .delete_expired_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get_session(old.session_id).await.unwrap().is_none());
        assert_eq!(repo.list_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn profile_in_use_cannot_be_deleted() {
        let repo = MemoryRepository::new();
        let base = ToolProfile {
            profile_id: Uuid::new_v4(),
            name: "base".into(),
            allowed_tools: vec![],
            denied_tools: vec![],
            rate_limits: RateLimits::default(),
            environment_scope: vec![],
            time_restrictions: vec![],
            inherited_from: None,
        };
        let child = ToolProfile {
            profile_id: Uuid::new_v4(),
            name: "child".into(),
            inherited_from: Some(base.profile_id),
            ..base.clone()
        };
        repo.upsert_profile(base.clone()).await.unwrap();
        repo.upsert_profile(child).await.unwrap();

        let err = repo.delete_profile(base.profile_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let u = user();
        {
            let repo = MemoryRepository::with_snapshot(dir.path()).unwrap();
            repo.insert_user(u.clone()).await.unwrap();
            repo.flush().unwrap();
        }
        let repo = MemoryRepository::with_snapshot(dir.path()).unwrap();
        let loaded = repo.get_user(u.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name, "dev");
    }

    #[tokio::test]
    async fn disconnect_helper_marks_all_connected() {
        let repo = MemoryRepository::new();
        let session_id = Uuid::new_v4();
        for _ in 0..2 {
            repo.insert_connection(SessionConnection {
                connection_id: Uuid::new_v4(),
                session_id,
                friendly_name: "vscode".into(),
                host_tool: "vscode".into(),
                connected_at: Utc::now(),
                last_heartbeat_at: Utc::now(),
                disconnected_at: None,
                status: ConnectionStatus::Connected,
            })
            .await
            .unwrap();
        }

        let n = disconnect_session_connections(&repo, session_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(n, 2);
        for c in repo.connections_for_session(session_id).await.unwrap() {
            assert_eq!(c.status, ConnectionStatus::Disconnected);
            assert!(c.disconnected_at.is_some());
        }
    }
}
