//! Per-call role checks for privileged services.
//!
//! [`AuthorizationService`] decorates one method handler. Before forwarding a call it looks up
//! the role the method requires and asks the [`RoleSource`] whether the caller's session holds
//! it. Every decision is made afresh and audit-logged on the `datagate::audit` target: denials
//! at WARN, grants at INFO.
use std::{collections::HashMap, sync::Arc};

use datagate_core::{
    auth::{Role, RoleSource},
    codec::Args,
    service::{CallContext, Invocation, Method},
    RpcError,
};
use tracing::{debug, info, warn};

pub const AUDIT_TARGET: &str = "datagate::audit";

/// Static `method name -> required role` map of one privileged service.
#[derive(Debug, Clone, Default)]
pub struct RoleRequirementMap {
    roles: HashMap<String, Role>,
}

impl RoleRequirementMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, method: &str, role: &str) -> Self {
        self.roles.insert(method.to_string(), Role::from(role));
        self
    }

    pub fn anonymous(mut self, method: &str) -> Self {
        self.roles.insert(method.to_string(), Role::Anonymous);
        self
    }

    pub fn get(&self, method: &str) -> Option<&Role> {
        self.roles.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

impl<K: Into<String>, R: AsRef<str>> FromIterator<(K, R)> for RoleRequirementMap {
    fn from_iter<T: IntoIterator<Item = (K, R)>>(iter: T) -> Self {
        Self {
            roles: iter
                .into_iter()
                .map(|(method, role)| (method.into(), Role::from(role.as_ref())))
                .collect(),
        }
    }
}

/// Authorizing decorator around a method handler.
pub struct AuthorizationService<M> {
    required: Option<Role>,
    roles: Arc<dyn RoleSource>,
    inner: M,
}

impl<M> AuthorizationService<M> {
    /// `required` is `None` for a method missing from the requirement map; such calls are
    /// always denied.
    pub fn new(required: Option<Role>, roles: Arc<dyn RoleSource>, inner: M) -> Self {
        Self {
            required,
            roles,
            inner,
        }
    }

    fn deny(&self, ctx: &CallContext, required: &str, reason: &str) -> Invocation {
        let (principal, session_id) = match &ctx.session {
            Some(session) => (session.principal.as_str(), session.id.get()),
            None => ("<none>", 0),
        };
        warn!(
            target: AUDIT_TARGET,
            principal,
            session_id,
            required_role = required,
            service = %ctx.service,
            method = %ctx.method,
            peer = %ctx.peer,
            "authorization denied: {reason}"
        );
        Invocation::err(RpcError::authorization_denied(format!(
            "{} requires role {required}",
            ctx.method
        )))
    }
}

impl<M: Method> Method for AuthorizationService<M> {
    fn invoke(&self, ctx: &CallContext, args: Args) -> Invocation {
        let role = match &self.required {
            None => return self.deny(ctx, "<unmapped>", "method has no role requirement"),
            Some(Role::Anonymous) => {
                debug!("{}.{} open to anonymous callers", ctx.service, ctx.method);
                return self.inner.invoke(ctx, args);
            }
            Some(Role::Named(role)) => role,
        };
        let Some(session) = &ctx.session else {
            return self.deny(ctx, role, "no session");
        };
        if !self.roles.has_role(session, role) {
            return self.deny(ctx, role, "role not held");
        }
        info!(
            target: AUDIT_TARGET,
            principal = session.principal.as_str(),
            session_id = session.id.get(),
            required_role = &**role,
            service = %ctx.service,
            method = %ctx.method,
            "authorization granted"
        );
        self.inner.invoke(ctx, args)
    }
}
