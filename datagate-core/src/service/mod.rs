//! The invocation surface services expose to the transport.
//!
//! A service is a [`MethodTable`]: a fixed map from `(method name, arity)` to a [`Method`]
//! handler, built once at registration time. Handlers run on worker threads and either answer
//! immediately ([`Invocation::Ready`]) or hand back a [`ResultFuture`] that some other party
//! completes later through its [`Promise`].
use std::sync::Arc;

use crate::{
    codec::{Args, Value},
    session::{Session, SessionBinding},
    RpcError,
};

mod method;
mod promise;

pub use method::{MethodTable, MethodTableBuilder, RegistrationError, ResolvedMethod};
pub use promise::{promise, Promise, ResultFuture};

pub type CallResult = Result<Value, RpcError>;

/// Everything a handler may know about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub correlation_key: u64,
    pub service: Arc<str>,
    pub method: Arc<str>,
    /// Remote address of the connection.
    pub peer: Arc<str>,
    /// The connection's session binding. Logon-type methods change it.
    pub binding: SessionBinding,
    /// The session validated for this call, absent for calls to the logon service.
    pub session: Option<Session>,
}

pub enum Invocation {
    Ready(CallResult),
    Pending(ResultFuture),
}

impl Invocation {
    pub fn ok(value: Value) -> Self {
        Invocation::Ready(Ok(value))
    }

    pub fn err(error: RpcError) -> Self {
        Invocation::Ready(Err(error))
    }
}

impl From<CallResult> for Invocation {
    fn from(value: CallResult) -> Self {
        Invocation::Ready(value)
    }
}

impl From<ResultFuture> for Invocation {
    fn from(value: ResultFuture) -> Self {
        Invocation::Pending(value)
    }
}

/// A resolved handler for one method of one service.
pub trait Method: Send + Sync + 'static {
    fn invoke(&self, ctx: &CallContext, args: Args) -> Invocation;
}

impl<F> Method for F
where
    F: Fn(&CallContext, Args) -> Invocation + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &CallContext, args: Args) -> Invocation {
        self(ctx, args)
    }
}

pub type BoxMethod = Arc<dyn Method>;
