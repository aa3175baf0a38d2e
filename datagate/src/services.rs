//! Demo services exposed by the launcher.
//!
//! `Data` stands in for a query engine: a fixed table, read synchronously or through an
//! asynchronous query that completes on a timer. `Admin` manages sessions and is gated by the
//! `admin` role, except for `getServerInfo`.
use std::{
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use datagate_core::{
    codec::{from_value, Value},
    service::{promise, CallContext, Invocation, MethodTable, RegistrationError},
    session::{Session, SessionId, SessionRegistry},
    RpcError,
};
use datagate_services::{authz::RoleRequirementMap, logon::ProductInfo};
use serde_json::json;
use tracing::info;

pub const DATA_SERVICE: &str = "Data";
pub const ADMIN_SERVICE: &str = "Admin";
pub const ADMIN_ROLE: &str = "admin";

const QUERY_DELAY: Duration = Duration::from_millis(20);

const ROWS: &[(u64, &str, &str)] = &[
    (1, "ledger", "finance"),
    (2, "orders", "sales"),
    (3, "customers", "sales"),
    (4, "payroll", "finance"),
];

fn rows(filter: impl Fn(&str, &str) -> bool) -> Value {
    ROWS.iter()
        .filter(|(_, name, owner)| filter(name, owner))
        .map(|(id, name, owner)| json!([id, name, owner]))
        .collect()
}

pub fn data_service() -> Result<MethodTable, RegistrationError> {
    MethodTable::builder()
        .method("getData", 0, |_, _| Invocation::ok(rows(|_, _| true)))
        .method("executeQuery", 1, |ctx: &CallContext, args| {
            let needle: String = match from_value(args.into_iter().next().unwrap_or_default()) {
                Ok(needle) => needle,
                Err(e) => return Invocation::err(e),
            };
            let principal = ctx
                .session
                .as_ref()
                .map(|s| s.principal.clone())
                .unwrap_or_default();
            let (promise, future) = promise();
            // completes on this worker's runtime once the worker is idle again
            monoio::spawn(async move {
                monoio::time::sleep(QUERY_DELAY).await;
                let result = rows(|name, owner| name.contains(&needle) || owner == needle);
                let matched = result.as_array().map_or(0, Vec::len);
                info!("query {needle:?} by {principal} matched {matched} row(s)");
                promise.complete(Ok(result));
            });
            Invocation::Pending(future)
        })
        .build()
}

fn describe(session: &Session) -> Value {
    let seconds = |t: std::time::SystemTime| {
        t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    };
    json!({
        "sessionId": session.id.get(),
        "principal": session.principal,
        "state": session.state,
        "createdAt": seconds(session.created_at),
        "lastValidatedAt": seconds(session.last_validated_at),
        "productInfo": session.product_info,
    })
}

pub fn admin_service(
    sessions: Arc<SessionRegistry>,
    product: ProductInfo,
) -> Result<(MethodTable, RoleRequirementMap), RegistrationError> {
    let list = sessions.clone();
    let table = MethodTable::builder()
        .method("getSessions", 0, move |_, _| {
            Invocation::ok(list.list().iter().map(describe).collect())
        })
        .method("terminateSession", 1, move |ctx: &CallContext, args| {
            let raw: u64 = match from_value(args.into_iter().next().unwrap_or_default()) {
                Ok(raw) => raw,
                Err(e) => return Invocation::err(e),
            };
            let Some(id) = SessionId::new(raw) else {
                return Invocation::err(RpcError::invalid_arguments("session id 0"));
            };
            let terminated = sessions.terminate(id);
            if terminated {
                info!("session {id} terminated from {}", ctx.peer);
            }
            Invocation::ok(json!(terminated))
        })
        .method("getServerInfo", 0, move |_, _| {
            Invocation::ok(json!({
                "productName": product.name,
                "productVersion": product.version,
            }))
        })
        .build()?;
    let roles = RoleRequirementMap::new()
        .require("getSessions", ADMIN_ROLE)
        .require("terminateSession", ADMIN_ROLE)
        .anonymous("getServerInfo");
    Ok((table, roles))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use datagate_core::{
        session::{SessionBinding, SessionState},
        ErrorKind,
    };

    use super::*;

    fn ctx(session: Option<Session>) -> CallContext {
        CallContext {
            correlation_key: 1,
            service: Arc::from(DATA_SERVICE),
            method: Arc::from("executeQuery"),
            peer: Arc::from("127.0.0.1:1"),
            binding: SessionBinding::default(),
            session,
        }
    }

    fn ready(invocation: Invocation) -> Result<Value, RpcError> {
        match invocation {
            Invocation::Ready(result) => result,
            Invocation::Pending(_) => panic!("expected an immediate answer"),
        }
    }

    #[test]
    fn get_data_returns_every_row() {
        let table = data_service().unwrap();
        let method = table.resolve("getData", 0).unwrap();
        let rows = ready(method.invoke(&ctx(None), vec![])).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), ROWS.len());
    }

    #[monoio::test(timer_enabled = true)]
    async fn query_completes_later() {
        let table = data_service().unwrap();
        let method = table.resolve("executeQuery", 1).unwrap();
        let future = match method.invoke(&ctx(None), vec![json!("sales")]) {
            Invocation::Pending(future) => future,
            Invocation::Ready(_) => panic!("expected a pending answer"),
        };
        assert!(!future.is_complete());
        let (tx, rx) = mpsc::channel();
        future.on_complete(move |result| {
            let _ = tx.send(result);
        });
        monoio::time::sleep(QUERY_DELAY * 5).await;
        let rows = rx.try_recv().unwrap().unwrap();
        assert_eq!(rows, json!([[2, "orders", "sales"], [3, "customers", "sales"]]));
    }

    #[test]
    fn bad_query_argument() {
        let table = data_service().unwrap();
        let method = table.resolve("executeQuery", 1).unwrap();
        let err = ready(method.invoke(&ctx(None), vec![json!(5)])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn admin_lists_and_terminates() {
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let (session, _) = sessions.logon("a", Default::default()).unwrap();
        let product = ProductInfo {
            name: "datagate".to_string(),
            version: "1".to_string(),
        };
        let (table, roles) = admin_service(sessions.clone(), product).unwrap();
        assert_eq!(
            roles.get("getSessions").map(ToString::to_string),
            Some(ADMIN_ROLE.to_string())
        );

        let listed = ready(table.resolve("getSessions", 0).unwrap().invoke(&ctx(None), vec![]))
            .unwrap();
        assert_eq!(listed[0]["principal"], "a");
        assert_eq!(listed[0]["state"], json!(SessionState::Active));

        let terminate = table.resolve("terminateSession", 1).unwrap();
        let args = vec![json!(session.id.get())];
        assert_eq!(ready(terminate.invoke(&ctx(None), args.clone())).unwrap(), json!(true));
        assert_eq!(ready(terminate.invoke(&ctx(None), args)).unwrap(), json!(false));
        assert!(sessions.is_empty());
    }
}
