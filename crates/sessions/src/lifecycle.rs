//! Session lifecycle evaluator and sweeper.
//!
//! The evaluator walks every live session each tick and promotes it through
//! `active → idle → spinning_down → expired`, terminating the user's
//! per-user MCP pool when the last live session of that user goes away.
//! The sweeper deletes long-expired rows. Both are periodic, cancellable,
//! and idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use amb_domain::config::SessionsConfig;
use amb_domain::entity::{Session, SessionStatus};
use amb_domain::error::Result;

use crate::repository::{disconnect_session_connections, SessionRepository};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The slice of the per-user MCP pool the lifecycle engine needs.
#[async_trait]
pub trait PoolHandle: Send + Sync {
    async fn terminate_for_user(&self, user_id: Uuid);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session locks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serializes state transitions per session. Each session id maps to a
/// `Semaphore(1)`; the permit auto-releases on drop.
pub struct SessionLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, session_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned()
            .await
            .expect("session lock semaphore never closes")
    }

    /// Drop locks nobody currently holds.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happened to a session during an evaluator tick. The gateway turns
/// these into audit events.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Idled {
        session_id: Uuid,
    },
    SpunDown {
        session_id: Uuid,
        user_id: Uuid,
        pool_terminated: bool,
    },
    Expired {
        session_id: Uuid,
        user_id: Uuid,
        pool_terminated: bool,
    },
}

pub struct SessionLifecycleManager {
    repo: Arc<dyn SessionRepository>,
    pool: Arc<dyn PoolHandle>,
    config: SessionsConfig,
    locks: Arc<SessionLockMap>,
}

impl SessionLifecycleManager {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        pool: Arc<dyn PoolHandle>,
        config: SessionsConfig,
    ) -> Self {
        Self {
            repo,
            pool,
            config,
            locks: Arc::new(SessionLockMap::new()),
        }
    }

    /// The lock map, shared with the heartbeat path so lifecycle transitions
    /// stay serialized per session no matter who drives them.
    pub fn locks(&self) -> Arc<SessionLockMap> {
        self.locks.clone()
    }

    /// One evaluator pass over every live session.
    pub async fn evaluate_tick(&self, now: DateTime<Utc>) -> Result<Vec<LifecycleEvent>> {
        let mut events = Vec::new();
        for snapshot in self.repo.live_sessions().await? {
            let _permit = self.locks.acquire(snapshot.session_id).await;
            // Re-read under the lock; a heartbeat may have raced us.
            let Some(session) = self.repo.get_session(snapshot.session_id).await? else {
                continue;
            };
            if !session.status.is_live() {
                continue;
            }
            if let Some(event) = self.step(session, now).await? {
                events.push(event);
            }
        }
        self.locks.prune_idle();
        Ok(events)
    }

    async fn step(&self, mut session: Session, now: DateTime<Utc>) -> Result<Option<LifecycleEvent>> {
        let idle_after = Duration::seconds(session.idle_timeout_s as i64);
        let spindown_after = idle_after + Duration::seconds(session.spindown_delay_s as i64);
        let quiet_for = now.signed_duration_since(session.last_activity_at);

        if session.expires_at <= now {
            let user_id = session.user_id;
            let session_id = session.session_id;
            session.status = SessionStatus::Expired;
            self.repo.update_session(session).await?;
            disconnect_session_connections(self.repo.as_ref(), session_id, now).await?;
            let pool_terminated = self.terminate_pool_if_last(user_id).await?;
            tracing::info!(session_id = %session_id, "session expired by evaluator");
            return Ok(Some(LifecycleEvent::Expired {
                session_id,
                user_id,
                pool_terminated,
            }));
        }

        match session.status {
            SessionStatus::Active if quiet_for >= idle_after => {
                let session_id = session.session_id;
                session.status = SessionStatus::Idle;
                self.repo.update_session(session).await?;
                tracing::debug!(session_id = %session_id, "session idled");
                Ok(Some(LifecycleEvent::Idled { session_id }))
            }
            SessionStatus::Idle | SessionStatus::SpinningDown
                if quiet_for >= spindown_after =>
            {
                let session_id = session.session_id;
                let user_id = session.user_id;
                session.status = SessionStatus::SpinningDown;
                self.repo.update_session(session.clone()).await?;

                // Tear the pool down, then the session is done.
                let pool_terminated = self.terminate_pool_if_last(user_id).await?;
                session.status = SessionStatus::Expired;
                self.repo.update_session(session).await?;
                disconnect_session_connections(self.repo.as_ref(), session_id, now).await?;
                tracing::info!(session_id = %session_id, "session spun down");
                Ok(Some(LifecycleEvent::SpunDown {
                    session_id,
                    user_id,
                    pool_terminated,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Terminate the user's pool unless another of their sessions is still
    /// live. The caller has already moved the current session out of the
    /// live set (or holds it at `spinning_down`, which does not keep a pool
    /// alive).
    async fn terminate_pool_if_last(&self, user_id: Uuid) -> Result<bool> {
        let others = self
            .repo
            .live_sessions_for_user(user_id)
            .await?
            .into_iter()
            .filter(|s| !matches!(s.status, SessionStatus::SpinningDown))
            .count();
        if others > 0 {
            return Ok(false);
        }
        self.pool.terminate_for_user(user_id).await;
        Ok(true)
    }

    /// One sweeper pass: delete rows expired longer ago than the retention
    /// window. Returns how many were removed.
    pub async fn sweep_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::seconds(self.config.retention_seconds as i64);
        let removed = self.repo.delete_expired_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "swept expired sessions");
        }
        Ok(removed)
    }
}
