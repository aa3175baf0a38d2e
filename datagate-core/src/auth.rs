//! Collaborators consulted for authentication and authorization.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    session::Session,
    util::hash::{digest_eq, sha256},
};

/// Logon credentials as sent by the client.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub application: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("application", &self.application)
            .finish_non_exhaustive()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("invalid credentials")]
    Rejected,
    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

/// Checks credentials and names the authenticated principal.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthFailure>;
}

/// Answers whether a session's principal holds a role.
pub trait RoleSource: Send + Sync + 'static {
    fn has_role(&self, session: &Session, role: &str) -> bool;
}

/// A role a method may require. [`Role::Anonymous`] is always satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Anonymous,
    Named(Arc<str>),
}

impl Role {
    pub fn named(name: &str) -> Self {
        Role::Named(Arc::from(name))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Anonymous => f.write_str("anonymous"),
            Role::Named(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        if value == "anonymous" {
            Role::Anonymous
        } else {
            Role::named(value)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    pub name: String,
    /// Hex SHA-256 of the password, unsalted.
    ///
    /// Only fit for demo and test directories; a deployment authenticates against a real
    /// credential store through its own [`Authenticator`].
    pub password_sha256: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

struct UserEntry {
    password_sha256: String,
    roles: HashSet<String>,
}

/// Static users with password digests and role sets.
#[derive(Default)]
pub struct UserDirectory {
    users: HashMap<String, UserEntry>,
}

impl UserDirectory {
    pub fn new(users: impl IntoIterator<Item = UserConfig>) -> Self {
        let users = users
            .into_iter()
            .map(|u| {
                (
                    u.name,
                    UserEntry {
                        password_sha256: u.password_sha256.to_ascii_lowercase(),
                        roles: u.roles.into_iter().collect(),
                    },
                )
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for UserDirectory {
    fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthFailure> {
        let entry = self
            .users
            .get(&credentials.user)
            .ok_or(AuthFailure::Rejected)?;
        if digest_eq(&entry.password_sha256, &sha256(&credentials.password)) {
            Ok(credentials.user.clone())
        } else {
            Err(AuthFailure::Rejected)
        }
    }
}

impl RoleSource for UserDirectory {
    fn has_role(&self, session: &Session, role: &str) -> bool {
        self.users
            .get(&session.principal)
            .map(|u| u.roles.contains(role))
            .unwrap_or(false)
    }
}
