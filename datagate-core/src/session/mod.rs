//! Sessions: the unit of authentication for a principal.
//!
//! A session is created by a successful logon, referenced by its [`SessionId`] from then on and
//! destroyed by logoff, administrative termination or inactivity expiry. Connections hold a
//! [`SessionBinding`] pointing at the session they are currently authenticated as.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

mod clock;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::SessionRegistry;

/// Process-unique session identifier. Zero is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

/// Server-side record of an authenticated principal.
///
/// The session secret itself is never stored, only its digest.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub principal: String,
    pub secret_digest: String,
    pub created_at: SystemTime,
    pub last_validated_at: SystemTime,
    pub product_info: BTreeMap<String, String>,
    pub state: SessionState,
}

/// What a client receives from a successful logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub session_id: u64,
    pub principal: String,
    pub product_info: BTreeMap<String, String>,
    pub secret: String,
}

impl SessionToken {
    pub fn new(session: &Session, secret: String) -> Self {
        Self {
            session_id: session.id.get(),
            principal: session.principal.clone(),
            product_info: session.product_info.clone(),
            secret,
        }
    }
}

/// The session a connection is currently bound to, shared with its in-flight calls.
#[derive(Debug, Clone, Default)]
pub struct SessionBinding(Arc<AtomicU64>);

impl SessionBinding {
    pub fn current(&self) -> Option<SessionId> {
        SessionId::new(self.0.load(Ordering::Acquire))
    }

    /// Bind to `id`, returning the previously bound session.
    pub fn bind(&self, id: SessionId) -> Option<SessionId> {
        SessionId::new(self.0.swap(id.get(), Ordering::AcqRel))
    }

    pub fn unbind(&self) -> Option<SessionId> {
        SessionId::new(self.0.swap(0, Ordering::AcqRel))
    }

    /// Unbind only if still bound to `id`.
    pub fn unbind_if(&self, id: SessionId) -> bool {
        self.0
            .compare_exchange(id.get(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_a_session() {
        assert!(SessionId::new(0).is_none());
        assert_eq!(SessionId::new(42).map(SessionId::get), Some(42));
    }

    #[test]
    fn binding() {
        let binding = SessionBinding::default();
        let shared = binding.clone();
        let a = SessionId::new(1).unwrap();
        let b = SessionId::new(2).unwrap();
        assert_eq!(binding.bind(a), None);
        assert_eq!(shared.current(), Some(a));
        assert_eq!(shared.bind(b), Some(a));
        assert!(!binding.unbind_if(a));
        assert!(binding.unbind_if(b));
        assert_eq!(shared.current(), None);
    }

    #[test]
    fn token_field_names() {
        let token = SessionToken {
            session_id: 42,
            principal: "a".to_string(),
            product_info: BTreeMap::new(),
            secret: "00".to_string(),
        };
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["sessionId"], 42);
        assert!(json.get("productInfo").is_some());
    }
}
