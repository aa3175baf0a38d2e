use std::{fmt::Debug, panic::AssertUnwindSafe};

use futures::FutureExt;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Service,
};
use tracing::error;

/// Outermost guard of a connection: a panic while serving one connection is turned into an
/// error for that connection only, leaving the I/O thread and its other connections running.
///
/// The inner service must be unwind safe in practice; state it shares with other connections
/// (the in-flight table, the session binding) is not touched once its owner panicked.
pub struct CatchPanicService<S> {
    inner: S,
}

#[derive(thiserror::Error, Debug)]
pub enum CatchPanicError<E> {
    #[error("{0}")]
    Inner(E),
    // a String keeps the error Send + Sync
    #[error("connection task panicked: {0}")]
    Panic(String),
}

impl<R, S> Service<R> for CatchPanicService<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = CatchPanicError<S::Error>;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match AssertUnwindSafe(self.inner.call(req)).catch_unwind().await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(CatchPanicError::Inner(e)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("connection task panicked: {message}");
                Err(CatchPanicError::Panic(message))
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<F> CatchPanicService<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| CatchPanicService { inner })
    }
}

impl<F: MakeService> MakeService for CatchPanicService<F> {
    type Service = CatchPanicService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(CatchPanicService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    struct Flaky;

    impl Service<u32> for Flaky {
        type Response = u32;
        type Error = Infallible;

        async fn call(&self, req: u32) -> Result<u32, Infallible> {
            if req == 0 {
                panic!("zero is not served");
            }
            Ok(req * 2)
        }
    }

    #[monoio::test]
    async fn panic_becomes_error() {
        let svc = CatchPanicService::new(Flaky);
        assert_eq!(svc.call(21).await.unwrap(), 42);
        match svc.call(0).await {
            Err(CatchPanicError::Panic(message)) => assert_eq!(message, "zero is not served"),
            _ => panic!("expected a caught panic"),
        }
        // still usable afterwards
        assert_eq!(svc.call(1).await.unwrap(), 2);
    }

    #[test]
    fn payload_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&7u8), "non-string panic payload");
    }
}
