//! Turns decoded request envelopes into work for the pool.
//!
//! Resolution (service, session, method) happens synchronously on the connection's thread and
//! is cheap; anything that may take time, including argument decoding, runs on a worker.
use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use datagate_core::{
    codec::{Codec, Value},
    orchestrator::PoolHandle,
    service::{CallContext, Invocation, ResolvedMethod},
    session::{SessionBinding, SessionRegistry},
    RpcError,
};
use service_async::MakeService;
use tracing::{error, trace};

use crate::{
    common::panic_message, pending::PendingCall, registry::ServiceRegistry, transport::Envelope,
};

#[derive(Clone)]
pub struct Dispatcher {
    services: Arc<ServiceRegistry>,
    sessions: Arc<SessionRegistry>,
    pool: PoolHandle,
    codec: Arc<dyn Codec>,
}

/// Per-connection facts the dispatcher needs.
#[derive(Clone)]
pub struct Caller {
    pub peer: Arc<str>,
    pub binding: SessionBinding,
}

impl Dispatcher {
    pub fn new(
        services: Arc<ServiceRegistry>,
        sessions: Arc<SessionRegistry>,
        pool: PoolHandle,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            services,
            sessions,
            pool,
            codec,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Resolve `request` and hand it to the pool. Never waits for the invocation; failures to
    /// resolve are answered through `pending` right away.
    pub fn dispatch(&self, request: Envelope, caller: &Caller, pending: PendingCall) {
        match self.resolve(&request, caller) {
            Ok((ctx, method)) => {
                let job = Job {
                    ctx,
                    method,
                    payload: request.payload,
                    arg_count: request.arg_count as usize,
                    codec: self.codec.clone(),
                    pending,
                };
                if self.pool.submit(Box::new(move || job.run())).is_err() {
                    // the job, and with it the pending call, was dropped and answered
                    error!("worker pool closed, call {} rejected", request.correlation_key);
                }
            }
            Err(e) => pending.complete(Err(e)),
        }
    }

    fn resolve(
        &self,
        request: &Envelope,
        caller: &Caller,
    ) -> Result<(CallContext, ResolvedMethod), RpcError> {
        let service = self.services.get(&request.service).ok_or_else(|| {
            RpcError::component_not_found(format!("no service {}", request.service))
        })?;
        let session = if service.anonymous {
            None
        } else {
            let id = caller
                .binding
                .current()
                .ok_or_else(|| RpcError::session_invalid("no session bound to this connection"))?;
            Some(self.sessions.validate(id)?)
        };
        let method = service
            .methods
            .resolve(&request.method, request.arg_count as usize)?;
        trace!(
            "dispatch {}.{} as call {}",
            service.name,
            method.name,
            request.correlation_key
        );
        let ctx = CallContext {
            correlation_key: request.correlation_key,
            service: service.name.clone(),
            method: method.name.clone(),
            peer: caller.peer.clone(),
            binding: caller.binding.clone(),
            session,
        };
        Ok((ctx, method))
    }
}

impl MakeService for Dispatcher {
    type Service = Dispatcher;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

/// One invocation, executed on a worker thread.
struct Job {
    ctx: CallContext,
    method: ResolvedMethod,
    payload: Bytes,
    arg_count: usize,
    codec: Arc<dyn Codec>,
    pending: PendingCall,
}

impl Job {
    fn run(self) {
        let Job {
            ctx,
            method,
            payload,
            arg_count,
            codec,
            pending,
        } = self;
        if pending.is_cancelled() {
            trace!("call {} cancelled before it started", ctx.correlation_key);
            pending.complete(Ok(Value::Null));
            return;
        }
        let args = match codec.decode_args(&payload, arg_count) {
            Ok(args) => args,
            Err(e) => return pending.complete(Err(e.into())),
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| method.invoke(&ctx, args))) {
            Ok(Invocation::Ready(result)) => pending.complete(result),
            Ok(Invocation::Pending(future)) => {
                future.on_complete(move |result| pending.complete(result))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                pending.complete(Err(RpcError::internal(format!(
                    "{}.{} panicked: {reason}",
                    ctx.service, ctx.method
                ))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use datagate_core::{
        auth::UserDirectory,
        codec::JsonCodec,
        config::{PoolConfig, RuntimeConfig, RuntimeType},
        orchestrator::WorkerPool,
        service::{promise, MethodTable},
        ErrorKind,
    };
    use futures::StreamExt;
    use futures_channel::mpsc::{unbounded, UnboundedReceiver};
    use serde_json::json;

    use super::*;
    use crate::pending::Outbound;

    struct Fixture {
        dispatcher: Dispatcher,
        sessions: Arc<SessionRegistry>,
        pool: WorkerPool,
    }

    fn fixture() -> Fixture {
        let runtime = RuntimeConfig {
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        };
        let pool = WorkerPool::start(&runtime, PoolConfig { worker_threads: 2 }).unwrap();
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let data = MethodTable::builder()
            .method("echo", 1, |_, args| Invocation::ok(args[0].clone()))
            .method("whoami", 0, |ctx, _| {
                Invocation::ok(json!(ctx.session.as_ref().map(|s| s.principal.clone())))
            })
            .method("boom", 0, |_, _| panic!("bad handler"))
            .method("later", 0, |_, _| {
                let (promise, future) = promise();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    promise.complete(Ok(json!("done")));
                });
                Invocation::Pending(future)
            })
            .build()
            .unwrap();
        let open = MethodTable::builder()
            .method("hello", 0, |_, _| Invocation::ok(json!("hi")))
            .build()
            .unwrap();
        let services = ServiceRegistry::builder(Arc::new(UserDirectory::default()))
            .register("Data", data, None)
            .unwrap()
            .register_anonymous("Open", open)
            .unwrap()
            .build();
        Fixture {
            dispatcher: Dispatcher::new(
                Arc::new(services),
                sessions.clone(),
                pool.handle(),
                Arc::new(JsonCodec),
            ),
            sessions,
            pool,
        }
    }

    fn caller() -> Caller {
        Caller {
            peer: Arc::from("test"),
            binding: SessionBinding::default(),
        }
    }

    fn call(
        fixture: &Fixture,
        caller: &Caller,
        key: u64,
        service: &str,
        method: &str,
        args: &[Value],
    ) -> (UnboundedReceiver<Outbound>, Arc<AtomicBool>) {
        let (tx, rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let payload = JsonCodec.encode_args(args).unwrap();
        let request = Envelope::request(key, service, method, args.len() as u16, payload);
        let pending = PendingCall::new(key, cancelled.clone(), tx, Arc::new(JsonCodec));
        fixture.dispatcher.dispatch(request, caller, pending);
        (rx, cancelled)
    }

    async fn answer(rx: &mut UnboundedReceiver<Outbound>) -> Result<Value, ErrorKind> {
        let outbound = monoio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .unwrap()
            .unwrap();
        match outbound {
            Outbound::Response {
                exception: false,
                payload,
                ..
            } => Ok(serde_json::from_slice(&payload).unwrap()),
            Outbound::Response { payload, .. } => {
                let wire = JsonCodec.decode_error(&payload).unwrap();
                Err(wire.kind)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn logon(fixture: &Fixture, caller: &Caller) {
        let (session, _) = fixture.sessions.logon("a", Default::default()).unwrap();
        caller.binding.bind(session.id);
    }

    #[monoio::test(timer_enabled = true)]
    async fn unknown_service_and_method() {
        let f = fixture();
        let c = caller();
        let (mut rx, _) = call(&f, &c, 1, "Nope", "x", &[]);
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::ComponentNotFound));
        logon(&f, &c);
        let (mut rx, _) = call(&f, &c, 2, "Data", "echo", &[]);
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::ComponentNotFound));
        f.pool.shutdown();
    }

    #[monoio::test(timer_enabled = true)]
    async fn session_required_except_anonymous() {
        let f = fixture();
        let c = caller();
        let (mut rx, _) = call(&f, &c, 1, "Data", "echo", &[json!(1)]);
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::SessionInvalid));
        let (mut rx, _) = call(&f, &c, 2, "Open", "hello", &[]);
        assert_eq!(answer(&mut rx).await, Ok(json!("hi")));

        logon(&f, &c);
        let (mut rx, _) = call(&f, &c, 3, "Data", "whoami", &[]);
        assert_eq!(answer(&mut rx).await, Ok(json!("a")));

        f.sessions.close(c.binding.current().unwrap());
        let (mut rx, _) = call(&f, &c, 4, "Data", "whoami", &[]);
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::SessionInvalid));
        f.pool.shutdown();
    }

    #[monoio::test(timer_enabled = true)]
    async fn bad_arguments_are_call_scoped() {
        let f = fixture();
        let c = caller();
        logon(&f, &c);
        let (tx, mut rx) = unbounded();
        let request = Envelope::request(9, "Data", "echo", 1, Bytes::from_static(b"[1, 2]"));
        let pending = PendingCall::new(9, Default::default(), tx, Arc::new(JsonCodec));
        f.dispatcher.dispatch(request, &c, pending);
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::InvalidArguments));
        f.pool.shutdown();
    }

    #[monoio::test(timer_enabled = true)]
    async fn panic_becomes_internal_error() {
        let f = fixture();
        let c = caller();
        logon(&f, &c);
        let (mut rx, _) = call(&f, &c, 1, "Data", "boom", &[]);
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::Internal));
        // the worker survived
        let (mut rx, _) = call(&f, &c, 2, "Data", "echo", &[json!("still here")]);
        assert_eq!(answer(&mut rx).await, Ok(json!("still here")));
        f.pool.shutdown();
    }

    #[monoio::test(timer_enabled = true)]
    async fn async_completion_from_foreign_thread() {
        let f = fixture();
        let c = caller();
        logon(&f, &c);
        let (mut rx, _) = call(&f, &c, 1, "Data", "later", &[]);
        assert_eq!(answer(&mut rx).await, Ok(json!("done")));
        // exactly one response: the sender is gone afterwards
        assert!(rx.next().await.is_none());
        f.pool.shutdown();
    }

    #[monoio::test(timer_enabled = true)]
    async fn cancelled_async_call_is_retired() {
        let f = fixture();
        let c = caller();
        logon(&f, &c);
        let (mut rx, cancelled) = call(&f, &c, 1, "Data", "later", &[]);
        cancelled.store(true, Ordering::Release);
        let outbound = monoio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .unwrap();
        assert!(matches!(outbound, Some(Outbound::Retire(1))));
        f.pool.shutdown();
    }

    #[monoio::test(timer_enabled = true)]
    async fn closed_pool_still_answers() {
        let f = fixture();
        let c = caller();
        let Fixture { dispatcher, pool, .. } = f;
        pool.shutdown();
        let (tx, mut rx) = unbounded();
        let request = Envelope::request(1, "Open", "hello", 0, Bytes::new());
        dispatcher.dispatch(request, &c, PendingCall::new(1, Default::default(), tx, Arc::new(JsonCodec)));
        assert_eq!(answer(&mut rx).await, Err(ErrorKind::Internal));
    }
}
