//! Ephemeral session authentication.
//!
//! Registration turns a preshared key into a short-lived session token;
//! authentication verifies tokens on every request; heartbeats extend
//! sessions; rotation invalidates every live session at once.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use amb_domain::config::SessionsConfig;
use amb_domain::entity::{
    PresharedKey, Session, SessionContext, SessionStatus, UserStatus,
};
use amb_domain::error::{Error, Result};

use crate::keys;
use crate::ratelimit::{MinIntervalLimiter, SlidingWindowLimiter};
use crate::repository::{disconnect_session_connections, SessionRepository};
use crate::token::{self, HmacSecret};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the client receives from a successful registration. The token is
/// shown exactly once.
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    pub session_id: Uuid,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub profile_id: Uuid,
}

/// Result of a heartbeat. `respawn_pool` asks the caller to bring the
/// user's per-user MCPs back if the session was coming out of idle or
/// spindown.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub respawn_pool: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EphemeralAuthProvider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EphemeralAuthProvider {
    repo: Arc<dyn SessionRepository>,
    secret: Arc<HmacSecret>,
    secret_path: PathBuf,
    config: SessionsConfig,
    register_limiter: SlidingWindowLimiter,
    heartbeat_limiter: MinIntervalLimiter,
}

impl EphemeralAuthProvider {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        secret: Arc<HmacSecret>,
        secret_path: PathBuf,
        config: SessionsConfig,
    ) -> Self {
        let register_limiter =
            SlidingWindowLimiter::new(config.register_per_minute, config.register_per_hour);
        let heartbeat_limiter = MinIntervalLimiter::new(config.heartbeat_min_interval_seconds);
        Self {
            repo,
            secret,
            secret_path,
            config,
            register_limiter,
            heartbeat_limiter,
        }
    }

    /// Exchange a preshared key for a session token.
    ///
    /// The failure modes deliberately collapse: a key that is malformed gets
    /// a shape error, but an unknown key, a revoked key, an expired key, and
    /// a suspended owner all come back as plain `unauthorized` — nothing
    /// here may reveal which one it was.
    pub async fn register_session(
        &self,
        raw_key: &str,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<RegisteredSession> {
        if !self.register_limiter.check(source_ip, now) {
            return Err(Error::RateLimited("session registration".into()));
        }

        let body = keys::parse_raw_key(raw_key)?;
        let prefix = keys::key_prefix(body);
        let candidates = self.repo.keys_by_prefix(prefix).await?;

        let matched: Option<PresharedKey> = {
            let mut found = None;
            for candidate in &candidates {
                if keys::verify_key(&candidate.key_salt, &candidate.key_hash, raw_key) {
                    found = Some(candidate.clone());
                    break;
                }
            }
            if candidates.is_empty() {
                // Keep the no-candidate path as expensive as a mismatch.
                keys::dummy_verify(raw_key);
            }
            found
        };
        let key = matched.ok_or(Error::Unauthorized)?;

        if key.expires_at.is_some_and(|t| t <= now) {
            return Err(Error::Unauthorized);
        }
        let user = self
            .repo
            .get_user(key.user_id)
            .await?
            .ok_or(Error::Unauthorized)?;
        if user.status != UserStatus::Active {
            return Err(Error::Unauthorized);
        }

        let session_id = Uuid::new_v4();
        let minted = token::mint_token(&self.secret.current(), session_id);
        let ttl = Duration::seconds(self.config.ttl_seconds as i64);
        let hard_max = Duration::seconds(self.config.ttl_hard_max_seconds as i64);
        let expires_at = (now + ttl).min(now + hard_max);

        let session = Session {
            session_id,
            user_id: user.user_id,
            profile_id: key.profile_id,
            token_hash: minted.hash_hex,
            token_nonce: minted.nonce_hex,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            expires_at,
            idle_timeout_s: self.config.idle_timeout_seconds,
            spindown_delay_s: self.config.spindown_delay_seconds,
        };
        self.repo.insert_session(session).await?;

        tracing::info!(
            session_id = %session_id,
            user_id = %user.user_id,
            "session registered"
        );
        Ok(RegisteredSession {
            session_id,
            session_token: minted.token,
            expires_at,
            user_id: user.user_id,
            profile_id: key.profile_id,
        })
    }

    /// Verify a presented token and produce the request's [`SessionContext`].
    /// Sessions found past their deadline are marked expired lazily.
    pub async fn authenticate(
        &self,
        presented_token: &str,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionContext> {
        let (nonce, session_id) = token::decode_token(presented_token)?;
        let session = self
            .repo
            .get_session(session_id)
            .await?
            .ok_or(Error::Unauthorized)?;
        if matches!(
            session.status,
            SessionStatus::Expired | SessionStatus::Suspended
        ) {
            return Err(Error::Unauthorized);
        }
        if !token::verify_token_hash(
            &self.secret.current(),
            &nonce,
            session_id,
            &session.token_hash,
        ) {
            return Err(Error::Unauthorized);
        }
        if session.expires_at <= now {
            self.mark_expired(session).await?;
            return Err(Error::Unauthorized);
        }

        Ok(SessionContext {
            session_id,
            user_id: session.user_id,
            profile_id: session.profile_id,
            client_id: None,
            source_ip: source_ip.to_owned(),
            attributes: Default::default(),
        })
    }

    /// Heartbeat: extend the session and wake it out of idle/spindown.
    pub async fn heartbeat(
        &self,
        presented_token: &str,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome> {
        let (nonce, session_id) = token::decode_token(presented_token)?;
        let mut session = self
            .repo
            .get_session(session_id)
            .await?
            .ok_or(Error::Unauthorized)?;
        if !token::verify_token_hash(
            &self.secret.current(),
            &nonce,
            session_id,
            &session.token_hash,
        ) {
            return Err(Error::Unauthorized);
        }
        if session.status == SessionStatus::Expired {
            return Err(Error::SessionExpired);
        }
        if session.expires_at <= now {
            self.mark_expired(session).await?;
            return Err(Error::SessionExpired);
        }
        if !self.heartbeat_limiter.check(session_id, now) {
            return Err(Error::RateLimited("heartbeat".into()));
        }

        let respawn_pool = matches!(
            session.status,
            SessionStatus::Idle | SessionStatus::Suspended | SessionStatus::SpinningDown
        );
        session.status = SessionStatus::Active;
        session.last_activity_at = now;
        let ttl = Duration::seconds(self.config.ttl_seconds as i64);
        let hard_max = Duration::seconds(self.config.ttl_hard_max_seconds as i64);
        session.expires_at = (now + ttl).min(session.created_at + hard_max);
        let outcome = HeartbeatOutcome {
            session_id,
            user_id: session.user_id,
            expires_at: session.expires_at,
            respawn_pool,
        };
        self.repo.update_session(session).await?;

        // Refresh liveness on every connected host tool.
        for mut connection in self.repo.connections_for_session(session_id).await? {
            if connection.disconnected_at.is_none() {
                connection.last_heartbeat_at = now;
                self.repo.update_connection(connection).await?;
            }
        }

        Ok(outcome)
    }

    /// Record activity on a session (called after a permitted tool call).
    pub async fn touch_activity(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut session) = self.repo.get_session(session_id).await? {
            if session.status.is_live() {
                session.last_activity_at = now;
                self.repo.update_session(session).await?;
            }
        }
        Ok(())
    }

    /// Rotate the HMAC secret: expire every live session, disconnect their
    /// connections, persist the new secret atomically, then swap it in
    /// memory. Returns the number of sessions invalidated. Running it twice
    /// invalidates nothing extra.
    pub async fn rotate_hmac_secret(
        &self,
        new_secret: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let live = self.repo.live_sessions().await?;
        let mut invalidated = 0usize;
        for session in live {
            let session_id = session.session_id;
            self.mark_expired(session).await?;
            disconnect_session_connections(self.repo.as_ref(), session_id, now).await?;
            invalidated += 1;
        }

        self.secret.rotate(new_secret, &self.secret_path)?;
        tracing::warn!(invalidated, "HMAC secret rotated");
        Ok(invalidated)
    }

    /// Maintenance: drop rate-limiter entries older than their windows.
    pub fn prune_limiters(&self, now: DateTime<Utc>) {
        self.register_limiter.prune(now);
    }

    async fn mark_expired(&self, mut session: Session) -> Result<()> {
        let session_id = session.session_id;
        session.status = SessionStatus::Expired;
        self.repo.update_session(session).await?;
        self.heartbeat_limiter.forget(session_id);
        tracing::info!(session_id = %session_id, "session expired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use crate::repository::MemoryRepository;
    use amb_domain::entity::{KeyStatus, User};

    struct Fixture {
        provider: EphemeralAuthProvider,
        repo: Arc<MemoryRepository>,
        raw_key: String,
        user_id: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn fixture(config: SessionsConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let secret_path = dir.path().join("hmac.secret");
        let secret = Arc::new(HmacSecret::load_or_create(&secret_path).unwrap());

        let user_id = Uuid::new_v4();
        repo.insert_user(User {
            user_id,
            display_name: "dev".into(),
            status: UserStatus::Active,
            auth_source: "seed".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let generated = generate_key();
        repo.insert_key(PresharedKey {
            key_id: Uuid::new_v4(),
            key_prefix: generated.prefix.clone(),
            key_salt: generated.salt_hex.clone(),
            key_hash: generated.hash_hex.clone(),
            user_id,
            profile_id: Uuid::new_v4(),
            status: KeyStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
        })
        .await
        .unwrap();

        Fixture {
            provider: EphemeralAuthProvider::new(
                repo.clone(),
                secret,
                secret_path,
                config,
            ),
            repo,
            raw_key: generated.raw,
            user_id,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn register_then_authenticate_roundtrip() {
        let f = fixture(SessionsConfig::default()).await;
        let now = Utc::now();
        let registered = f
            .provider
            .register_session(&f.raw_key, "10.0.0.1", now)
            .await
            .unwrap();

        let ctx = f
            .provider
            .authenticate(&registered.session_token, "10.0.0.1", now)
            .await
            .unwrap();
        assert_eq!(ctx.session_id, registered.session_id);
        assert_eq!(ctx.user_id, f.user_id);
    }

    #[tokio::test]
    async fn unknown_and_malformed_keys_are_distinguishable_only_by_shape() {
        let f = fixture(SessionsConfig::default()).await;
        let now = Utc::now();

        let err = f
            .provider
            .register_session("not-a-key", "ip", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Well-formed but unknown: plain unauthorized.
        let ghost = generate_key();
        let err = f
            .provider
            .register_session(&ghost.raw, "ip", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[tokio::test]
    async fn suspended_user_is_rejected() {
        let f = fixture(SessionsConfig::default()).await;
        f.repo
            .set_user_status(f.user_id, UserStatus::Suspended)
            .await
            .unwrap();
        let err = f
            .provider
            .register_session(&f.raw_key, "ip", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[tokio::test]
    async fn registration_rate_limit() {
        let config = SessionsConfig {
            register_per_minute: 2,
            ..Default::default()
        };
        let f = fixture(config).await;
        let now = Utc::now();
        f.provider
            .register_session(&f.raw_key, "1.2.3.4", now)
            .await
            .unwrap();
        f.provider
            .register_session(&f.raw_key, "1.2.3.4", now)
            .await
            .unwrap();
        let err = f
            .provider
            .register_session(&f.raw_key, "1.2.3.4", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));

        // Another IP is unaffected.
        f.provider
            .register_session(&f.raw_key, "5.6.7.8", now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_exactly_at_expiry_is_expired() {
        let f = fixture(SessionsConfig::default()).await;
        let now = Utc::now();
        let registered = f
            .provider
            .register_session(&f.raw_key, "ip", now)
            .await
            .unwrap();

        let err = f
            .provider
            .authenticate(&registered.session_token, "ip", registered.expires_at)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        // Lazily marked expired in storage.
        let stored = f
            .repo
            .get_session(registered.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn heartbeat_extends_but_never_past_hard_ceiling() {
        let config = SessionsConfig {
            ttl_seconds: 3_600,
            ttl_hard_max_seconds: 5_400,
            heartbeat_min_interval_seconds: 0,
            ..Default::default()
        };
        let f = fixture(config).await;
        let t0 = Utc::now();
        let registered = f
            .provider
            .register_session(&f.raw_key, "ip", t0)
            .await
            .unwrap();

        // One hour in: extension would pass the ceiling, so it clamps.
        let t1 = t0 + Duration::seconds(3_000);
        let outcome = f
            .provider
            .heartbeat(&registered.session_token, t1)
            .await
            .unwrap();
        assert_eq!(outcome.expires_at, t0 + Duration::seconds(5_400));
    }

    #[tokio::test]
    async fn heartbeat_rate_limited_per_session() {
        let f = fixture(SessionsConfig::default()).await;
        let now = Utc::now();
        let registered = f
            .provider
            .register_session(&f.raw_key, "ip", now)
            .await
            .unwrap();

        f.provider
            .heartbeat(&registered.session_token, now)
            .await
            .unwrap();
        let err = f
            .provider
            .heartbeat(&registered.session_token, now + Duration::seconds(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        // Past the window it succeeds again.
        f.provider
            .heartbeat(&registered.session_token, now + Duration::seconds(6))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn heartbeat_wakes_idle_session_and_requests_respawn() {
        let config = SessionsConfig {
            heartbeat_min_interval_seconds: 0,
            ..Default::default()
        };
        let f = fixture(config).await;
        let now = Utc::now();
        let registered = f
            .provider
            .register_session(&f.raw_key, "ip", now)
            .await
            .unwrap();

        let mut session = f
            .repo
            .get_session(registered.session_id)
            .await
            .unwrap()
            .unwrap();
        session.status = SessionStatus::SpinningDown;
        f.repo.update_session(session).await.unwrap();

        let outcome = f
            .provider
            .heartbeat(&registered.session_token, now + Duration::seconds(1))
            .await
            .unwrap();
        assert!(outcome.respawn_pool);
        let stored = f
            .repo
            .get_session(registered.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn expired_session_heartbeat_is_gone() {
        let f = fixture(SessionsConfig::default()).await;
        let now = Utc::now();
        let registered = f
            .provider
            .register_session(&f.raw_key, "ip", now)
            .await
            .unwrap();
        let mut session = f
            .repo
            .get_session(registered.session_id)
            .await
            .unwrap()
            .unwrap();
        session.status = SessionStatus::Expired;
        f.repo.update_session(session).await.unwrap();

        let err = f
            .provider
            .heartbeat(&registered.session_token, now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
    }

    #[tokio::test]
    async fn rotation_invalidates_every_live_session_once() {
        let f = fixture(SessionsConfig::default()).await;
        let now = Utc::now();
        let a = f
            .provider
            .register_session(&f.raw_key, "ip-a", now)
            .await
            .unwrap();
        let b = f
            .provider
            .register_session(&f.raw_key, "ip-b", now)
            .await
            .unwrap();

        let invalidated = f
            .provider
            .rotate_hmac_secret(token::random_secret(), now)
            .await
            .unwrap();
        assert_eq!(invalidated, 2);

        for registered in [&a, &b] {
            let err = f
                .provider
                .authenticate(&registered.session_token, "ip", now)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Unauthorized));
        }

        // A second rotation finds nothing live.
        let again = f
            .provider
            .rotate_hmac_secret(token::random_secret(), now)
            .await
            .unwrap();
        assert_eq!(again, 0);

        // New registrations work under the new secret.
        let fresh = f
            .provider
            .register_session(&f.raw_key, "ip-c", now)
            .await
            .unwrap();
        f.provider
            .authenticate(&fresh.session_token, "ip", now)
            .await
            .unwrap();
    }
}
