use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

/// Message sent to clients in place of any internal failure detail.
pub const COMPONENT_FAILURE: &str = "component failure";

/// Classification of a call-scoped failure.
///
/// Only [`ErrorKind::Protocol`] is fatal for a connection; every other kind is reported to the
/// caller and leaves the connection and its session intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    ComponentNotFound,
    SessionInvalid,
    AuthorizationDenied,
    AuthenticationFailed,
    ComponentUnavailable,
    InvalidArguments,
    Application,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::ComponentNotFound => "component_not_found",
            ErrorKind::SessionInvalid => "session_invalid",
            ErrorKind::AuthorizationDenied => "authorization_denied",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::ComponentUnavailable => "component_unavailable",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::Application => "application",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure scoped to one invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn component_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ComponentNotFound, message)
    }

    pub fn session_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionInvalid, message)
    }

    pub fn authorization_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthorizationDenied, message)
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationFailed, message)
    }

    pub fn component_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ComponentUnavailable, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    /// A failure declared by the invoked method itself. Delivered to the caller verbatim.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    /// A broken server-side invariant. The message is only ever logged.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The representation sent to the client. Internal detail is replaced by
    /// [`COMPONENT_FAILURE`].
    pub fn to_wire(&self) -> WireError {
        let message = match self.kind {
            ErrorKind::Internal => COMPONENT_FAILURE.to_string(),
            _ => self.message.clone(),
        };
        WireError {
            kind: self.kind,
            message,
        }
    }
}

/// Exception payload as carried by a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<WireError> for RpcError {
    fn from(value: WireError) -> Self {
        RpcError::new(value.kind, value.message)
    }
}
