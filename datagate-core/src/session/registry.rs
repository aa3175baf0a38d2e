use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tracing::{debug, info};

use super::{Clock, Session, SessionId, SessionState, SessionToken, SystemClock};
use crate::{
    util::hash::{digest_eq, sha256},
    RpcError,
};

/// Creates, validates and invalidates sessions.
///
/// Only live sessions (pending or active) are kept; closing or expiring a session removes it,
/// after which every validation of its id fails. Ids come from a monotonic counter and are never
/// reused.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    next_id: AtomicU64,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_clock(idle_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(idle_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            idle_timeout,
            clock,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Create a pending session for an authenticated principal. Returns the session and its
    /// secret; the secret is not retrievable afterwards.
    pub fn create(
        &self,
        principal: impl Into<String>,
        product_info: BTreeMap<String, String>,
    ) -> (Session, String) {
        let id = loop {
            // fetch_add starts at 1; skipping 0 only matters after wrapping
            if let Some(id) = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed)) {
                break id;
            }
        };
        let secret = hex::encode(rand::random::<[u8; 32]>());
        let now = self.clock.now();
        let session = Session {
            id,
            principal: principal.into(),
            secret_digest: sha256(&secret),
            created_at: now,
            last_validated_at: now,
            product_info,
            state: SessionState::Pending,
        };
        self.sessions.insert(id, session.clone());
        debug!("session {id} created for {}", session.principal);
        (session, secret)
    }

    /// Move a pending session to active.
    pub fn activate(&self, id: SessionId) -> Result<Session, RpcError> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| unknown_session(id))?;
        if entry.state != SessionState::Pending {
            return Err(RpcError::session_invalid(format!(
                "session {id} cannot be activated"
            )));
        }
        entry.state = SessionState::Active;
        entry.last_validated_at = self.clock.now();
        info!("session {id} active for {}", entry.principal);
        Ok(entry.clone())
    }

    /// Create and activate a session in one step, returning the token for the client.
    pub fn logon(
        &self,
        principal: impl Into<String>,
        product_info: BTreeMap<String, String>,
    ) -> Result<(Session, SessionToken), RpcError> {
        let (session, secret) = self.create(principal, product_info);
        let session = self.activate(session.id)?;
        let token = SessionToken::new(&session, secret);
        Ok((session, token))
    }

    /// Check that `id` names a live, active session and refresh its last-validated time.
    ///
    /// A session idle for longer than the timeout expires here even if the reaper has not
    /// reached it yet.
    pub fn validate(&self, id: SessionId) -> Result<Session, RpcError> {
        let now = self.clock.now();
        {
            let mut entry = self
                .sessions
                .get_mut(&id)
                .ok_or_else(|| unknown_session(id))?;
            if entry.state != SessionState::Active {
                return Err(RpcError::session_invalid(format!(
                    "session {id} is not active"
                )));
            }
            if !self.is_idle(&entry, now) {
                entry.last_validated_at = now;
                return Ok(entry.clone());
            }
        }
        self.expire(id);
        Err(RpcError::session_invalid(format!("session {id} expired")))
    }

    /// Like [`SessionRegistry::validate`], additionally proving possession of the secret.
    pub fn validate_secret(&self, id: SessionId, secret: &str) -> Result<Session, RpcError> {
        let matches = self
            .sessions
            .get(&id)
            .map(|s| digest_eq(&s.secret_digest, &sha256(secret)))
            .unwrap_or(false);
        if !matches {
            return Err(unknown_session(id));
        }
        self.validate(id)
    }

    /// Close a session. Closing an unknown or already closed session is a no-op.
    pub fn close(&self, id: SessionId) -> Option<Session> {
        let (_, mut session) = self.sessions.remove(&id)?;
        session.state = SessionState::Closed;
        info!("session {id} of {} closed", session.principal);
        Some(session)
    }

    /// Administrative close.
    pub fn terminate(&self, id: SessionId) -> bool {
        self.close(id).is_some()
    }

    /// Expire every active session idle for longer than the timeout.
    pub fn expire_idle(&self) -> Vec<Session> {
        let now = self.clock.now();
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.state == SessionState::Active && self.is_idle(s.value(), now))
            .map(|s| s.id)
            .collect();
        idle.into_iter().filter_map(|id| self.expire(id)).collect()
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Snapshot of the live sessions, ordered by id.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn is_idle(&self, session: &Session, now: std::time::SystemTime) -> bool {
        now.duration_since(session.last_validated_at)
            .map(|idle| idle > self.idle_timeout)
            .unwrap_or(false)
    }

    fn expire(&self, id: SessionId) -> Option<Session> {
        let (_, mut session) = self
            .sessions
            .remove_if(&id, |_, s| s.state == SessionState::Active)?;
        session.state = SessionState::Expired;
        info!("session {id} of {} expired", session.principal);
        Some(session)
    }
}

fn unknown_session(id: SessionId) -> RpcError {
    RpcError::session_invalid(format!("session {id} is unknown or no longer valid"))
}
