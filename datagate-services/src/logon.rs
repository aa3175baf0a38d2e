//! The logon service: the only service reachable without a validated session.
//!
//! | method | args | |
//! |---|---|---|
//! | `logon` | credentials | authenticate and bind a new session to the connection |
//! | `ping` | | keep the bound session alive |
//! | `logoff` | | close the bound session; idempotent |
//! | `assertIdentity` | session id, or `{sessionId, secret}` | adopt an existing session |
use std::{collections::BTreeMap, sync::Arc};

use datagate_core::{
    auth::{AuthFailure, Authenticator, Credentials},
    codec::{from_value, to_value, Args, Value},
    service::{CallContext, Invocation, MethodTable, RegistrationError, ResultFuture},
    session::{SessionId, SessionRegistry},
    RpcError,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

pub const LOGON_SERVICE: &str = "Logon";

#[derive(Debug, Clone)]
pub struct ProductInfo {
    pub name: String,
    pub version: String,
}

pub struct LogonService {
    sessions: Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    product: ProductInfo,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdentityClaim {
    Bare(u64),
    #[serde(rename_all = "camelCase")]
    WithSecret { session_id: u64, secret: String },
}

impl LogonService {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        authenticator: Arc<dyn Authenticator>,
        product: ProductInfo,
    ) -> Self {
        Self {
            sessions,
            authenticator,
            product,
        }
    }

    pub fn into_methods(self) -> Result<MethodTable, RegistrationError> {
        let this = Arc::new(self);
        let (logon, ping, logoff, identity) = (this.clone(), this.clone(), this.clone(), this);
        MethodTable::builder()
            .method("logon", 1, move |ctx, args| logon.logon(ctx, args).into())
            .method("ping", 0, move |ctx, _| ping.ping(ctx))
            .method("logoff", 0, move |ctx, _| logoff.logoff(ctx).into())
            .method("assertIdentity", 1, move |ctx, args| {
                identity.assert_identity(ctx, args).into()
            })
            .build()
    }

    fn logon(&self, ctx: &CallContext, args: Args) -> Result<Value, RpcError> {
        let credentials: Credentials = from_value(first(args))?;
        let principal = match self.authenticator.authenticate(&credentials) {
            Ok(principal) => principal,
            Err(AuthFailure::Rejected) => {
                info!("logon failed for user {} from {}", credentials.user, ctx.peer);
                return Err(RpcError::authentication_failed("invalid credentials"));
            }
            Err(AuthFailure::Unavailable(reason)) => {
                warn!("authenticator unavailable for user {}: {reason}", credentials.user);
                return Err(RpcError::component_unavailable(
                    "authentication service unavailable",
                ));
            }
        };

        let mut product_info = BTreeMap::from([
            ("productName".to_string(), self.product.name.clone()),
            ("productVersion".to_string(), self.product.version.clone()),
        ]);
        if let Some(application) = credentials.application {
            product_info.insert("applicationName".to_string(), application);
        }

        // only an active session is ever visible through the binding
        let (session, token) = self.sessions.logon(principal, product_info)?;
        if let Some(previous) = ctx.binding.bind(session.id) {
            self.sessions.close(previous);
        }
        info!(
            "logon of {} from {} as session {}",
            session.principal, ctx.peer, session.id
        );
        to_value(&token)
    }

    fn ping(&self, ctx: &CallContext) -> Invocation {
        if let Some(id) = ctx.binding.current() {
            if let Err(e) = self.sessions.validate(id) {
                return Invocation::err(e);
            }
        }
        Invocation::Pending(ResultFuture::ready(Ok(Value::Null)))
    }

    fn logoff(&self, ctx: &CallContext) -> Result<Value, RpcError> {
        if let Some(id) = ctx.binding.unbind() {
            self.sessions.close(id);
        }
        Ok(Value::Null)
    }

    fn assert_identity(&self, ctx: &CallContext, args: Args) -> Result<Value, RpcError> {
        let session = match from_value::<IdentityClaim>(first(args))? {
            IdentityClaim::Bare(raw) => {
                let id = session_id(raw)?;
                // a bare id only re-validates the session this connection already holds
                if ctx.binding.current() != Some(id) {
                    return Err(RpcError::session_invalid(format!(
                        "session {id} is not bound to this connection"
                    )));
                }
                self.sessions.validate(id)?
            }
            IdentityClaim::WithSecret { session_id: raw, secret } => {
                let id = session_id(raw)?;
                let session = self.sessions.validate_secret(id, &secret)?;
                if ctx.binding.bind(id) != Some(id) {
                    info!("session {id} of {} adopted by {}", session.principal, ctx.peer);
                }
                session
            }
        };
        Ok(json!({
            "sessionId": session.id.get(),
            "principal": session.principal,
            "productInfo": session.product_info,
        }))
    }
}

fn first(args: Args) -> Value {
    args.into_iter().next().unwrap_or(Value::Null)
}

fn session_id(raw: u64) -> Result<SessionId, RpcError> {
    SessionId::new(raw).ok_or_else(|| RpcError::session_invalid("session id 0 is never valid"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use datagate_core::{
        auth::{UserConfig, UserDirectory},
        session::{SessionBinding, SessionToken},
        util::hash::sha256,
        ErrorKind,
    };

    use super::*;

    struct Unreachable;

    impl Authenticator for Unreachable {
        fn authenticate(&self, _: &Credentials) -> Result<String, AuthFailure> {
            Err(AuthFailure::Unavailable("ldap down".to_string()))
        }
    }

    fn service(authenticator: Arc<dyn Authenticator>) -> (MethodTable, Arc<SessionRegistry>) {
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let product = ProductInfo {
            name: "datagate".to_string(),
            version: "1.0".to_string(),
        };
        let table = LogonService::new(sessions.clone(), authenticator, product)
            .into_methods()
            .unwrap();
        (table, sessions)
    }

    fn users() -> Arc<dyn Authenticator> {
        Arc::new(UserDirectory::new([UserConfig {
            name: "a".to_string(),
            password_sha256: sha256("x"),
            roles: vec![],
        }]))
    }

    fn ctx(binding: &SessionBinding) -> CallContext {
        CallContext {
            correlation_key: 1,
            service: Arc::from(LOGON_SERVICE),
            method: Arc::from("logon"),
            peer: Arc::from("test"),
            binding: binding.clone(),
            session: None,
        }
    }

    fn call(table: &MethodTable, ctx: &CallContext, method: &str, args: Args) -> Result<Value, RpcError> {
        match table.resolve(method, args.len()).unwrap().invoke(ctx, args) {
            Invocation::Ready(r) => r,
            Invocation::Pending(future) => {
                let (tx, rx) = std::sync::mpsc::channel();
                future.on_complete(move |r| tx.send(r).unwrap());
                rx.recv().unwrap()
            }
        }
    }

    #[test]
    fn logon_binds_session() {
        let (table, sessions) = service(users());
        let binding = SessionBinding::default();
        let token = call(
            &table,
            &ctx(&binding),
            "logon",
            vec![json!({"user": "a", "password": "x", "application": "bi-tool"})],
        )
        .unwrap();
        let token: SessionToken = serde_json::from_value(token).unwrap();
        assert_eq!(token.principal, "a");
        assert_eq!(token.product_info["productName"], "datagate");
        assert_eq!(token.product_info["applicationName"], "bi-tool");
        assert_eq!(binding.current().map(SessionId::get), Some(token.session_id));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn bound_session_is_already_active() {
        let (table, sessions) = service(users());
        let binding = SessionBinding::default();
        let watcher = {
            let binding = binding.clone();
            let sessions = sessions.clone();
            std::thread::spawn(move || loop {
                if let Some(id) = binding.current() {
                    return sessions.validate(id).map(|s| s.id);
                }
                std::hint::spin_loop();
            })
        };
        call(&table, &ctx(&binding), "logon", vec![json!({"user": "a", "password": "x"})]).unwrap();
        assert_eq!(watcher.join().unwrap().ok(), binding.current());
    }

    #[test]
    fn bad_credentials() {
        let (table, sessions) = service(users());
        let binding = SessionBinding::default();
        let err = call(&table, &ctx(&binding), "logon", vec![json!({"user": "a", "password": "y"})])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(binding.current().is_none());
        assert!(sessions.is_empty());

        let err = call(&table, &ctx(&binding), "logon", vec![json!("a:x")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn authenticator_unavailable() {
        let (table, _) = service(Arc::new(Unreachable));
        let err = call(
            &table,
            &ctx(&SessionBinding::default()),
            "logon",
            vec![json!({"user": "a", "password": "x"})],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComponentUnavailable);
    }

    #[test]
    fn relogon_replaces_session() {
        let (table, sessions) = service(users());
        let binding = SessionBinding::default();
        let creds = json!({"user": "a", "password": "x"});
        call(&table, &ctx(&binding), "logon", vec![creds.clone()]).unwrap();
        let first = binding.current().unwrap();
        call(&table, &ctx(&binding), "logon", vec![creds]).unwrap();
        assert_ne!(binding.current(), Some(first));
        assert!(sessions.get(first).is_none());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn logoff_twice() {
        let (table, sessions) = service(users());
        let binding = SessionBinding::default();
        call(&table, &ctx(&binding), "logon", vec![json!({"user": "a", "password": "x"})]).unwrap();
        assert_eq!(call(&table, &ctx(&binding), "logoff", vec![]), Ok(Value::Null));
        assert_eq!(call(&table, &ctx(&binding), "logoff", vec![]), Ok(Value::Null));
        assert!(sessions.is_empty());
    }

    #[test]
    fn ping_acknowledges() {
        let (table, sessions) = service(users());
        let binding = SessionBinding::default();
        assert_eq!(call(&table, &ctx(&binding), "ping", vec![]), Ok(Value::Null));
        call(&table, &ctx(&binding), "logon", vec![json!({"user": "a", "password": "x"})]).unwrap();
        assert_eq!(call(&table, &ctx(&binding), "ping", vec![]), Ok(Value::Null));
        sessions.close(binding.current().unwrap());
        assert_eq!(
            call(&table, &ctx(&binding), "ping", vec![]).unwrap_err().kind(),
            ErrorKind::SessionInvalid
        );
    }

    #[test]
    fn assert_identity_on_new_connection() {
        let (table, _) = service(users());
        let original = SessionBinding::default();
        let token: SessionToken = serde_json::from_value(
            call(&table, &ctx(&original), "logon", vec![json!({"user": "a", "password": "x"})])
                .unwrap(),
        )
        .unwrap();

        let failover = SessionBinding::default();
        // the id alone is not enough on a connection that never held the session
        let err = call(&table, &ctx(&failover), "assertIdentity", vec![json!(token.session_id)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionInvalid);

        let claim = json!({"sessionId": token.session_id, "secret": token.secret});
        let asserted = call(&table, &ctx(&failover), "assertIdentity", vec![claim]).unwrap();
        assert_eq!(asserted["principal"], "a");
        assert_eq!(failover.current().map(SessionId::get), Some(token.session_id));

        // now bound, the bare id works
        assert!(call(&table, &ctx(&failover), "assertIdentity", vec![json!(token.session_id)]).is_ok());
    }

    #[test]
    fn assert_unknown_identity() {
        let (table, _) = service(users());
        let binding = SessionBinding::default();
        let claim = json!({"sessionId": 99, "secret": "00"});
        let err = call(&table, &ctx(&binding), "assertIdentity", vec![claim]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionInvalid);
        assert!(binding.current().is_none());
    }
}
