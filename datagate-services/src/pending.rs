//! Routing of invocation results back to the connection that asked for them.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use datagate_core::{codec::Codec, service::CallResult, ErrorKind, RpcError};
use futures_channel::mpsc::UnboundedSender;
use tracing::{error, trace};

/// Messages from calls (on any thread) to a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    /// An encoded result for `key`.
    Response {
        key: u64,
        exception: bool,
        payload: Bytes,
    },
    /// `key` finished without a response; free it.
    Retire(u64),
    /// Sent by the connection itself: write this exception for `key`, then close.
    Abort { key: u64, payload: Bytes },
    /// Sent by the connection itself: stop writing.
    Shutdown,
}

/// Ties a correlation key to the connection that must receive its single response.
///
/// Completing consumes the call. A call dropped without completion answers with an internal
/// error, so the key is always retired.
pub struct PendingCall {
    key: u64,
    cancelled: Arc<AtomicBool>,
    sink: Option<UnboundedSender<Outbound>>,
    codec: Arc<dyn Codec>,
}

impl PendingCall {
    pub fn new(
        key: u64,
        cancelled: Arc<AtomicBool>,
        sink: UnboundedSender<Outbound>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            key,
            cancelled,
            sink: Some(sink),
            codec,
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn complete(mut self, result: CallResult) {
        if let Some(sink) = self.sink.take() {
            self.deliver(&sink, result);
        }
    }

    fn deliver(&self, sink: &UnboundedSender<Outbound>, result: CallResult) {
        let message = if self.is_cancelled() {
            trace!("call {} was cancelled, response suppressed", self.key);
            Outbound::Retire(self.key)
        } else {
            self.encode(result)
        };
        // the connection may be gone already; nobody is left to tell
        if sink.unbounded_send(message).is_err() {
            trace!("connection closed before call {} completed", self.key);
        }
    }

    fn encode(&self, result: CallResult) -> Outbound {
        let encoded = match result {
            Ok(value) => self
                .codec
                .encode_value(&value)
                .map(|payload| (false, payload))
                .map_err(|e| RpcError::internal(format!("encode result: {e}"))),
            Err(e) => Err(e),
        };
        let (exception, payload) = match encoded {
            Ok(ok) => ok,
            Err(e) => {
                if e.kind() == ErrorKind::Internal {
                    error!("call {} failed: {}", self.key, e.message());
                }
                match self.codec.encode_error(&e.to_wire()) {
                    Ok(payload) => (true, payload),
                    Err(e) => {
                        error!("encode error body for call {}: {e}", self.key);
                        (true, Bytes::new())
                    }
                }
            }
        };
        Outbound::Response {
            key: self.key,
            exception,
            payload,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.deliver(
                &sink,
                Err(RpcError::internal(format!(
                    "call {} dropped without a result",
                    self.key
                ))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use datagate_core::{codec::JsonCodec, COMPONENT_FAILURE};
    use futures_channel::mpsc::{unbounded, UnboundedReceiver};
    use serde_json::json;

    use super::*;

    fn call(key: u64) -> (PendingCall, Arc<AtomicBool>, UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            PendingCall::new(key, cancelled.clone(), tx, Arc::new(JsonCodec)),
            cancelled,
            rx,
        )
    }

    #[test]
    fn success() {
        let (pending, _, mut rx) = call(3);
        pending.complete(Ok(json!([1, 2])));
        match rx.try_next().unwrap().unwrap() {
            Outbound::Response {
                key,
                exception,
                payload,
            } => {
                assert_eq!(key, 3);
                assert!(!exception);
                assert_eq!(&payload[..], b"[1,2]");
            }
            other => panic!("unexpected {other:?}"),
        }
        // the sender went away with the call
        assert!(rx.try_next().unwrap().is_none());
    }

    #[test]
    fn internal_detail_masked() {
        let (pending, _, mut rx) = call(4);
        pending.complete(Err(RpcError::internal("index out of bounds")));
        let Some(Outbound::Response { payload, exception, .. }) = rx.try_next().unwrap() else {
            panic!("expected a response");
        };
        assert!(exception);
        let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(body["kind"], "internal");
        assert_eq!(body["message"], COMPONENT_FAILURE);
    }

    #[test]
    fn cancelled_call_only_retires() {
        let (pending, cancelled, mut rx) = call(5);
        cancelled.store(true, Ordering::Release);
        pending.complete(Ok(json!(1)));
        assert!(matches!(rx.try_next().unwrap(), Some(Outbound::Retire(5))));
    }

    #[test]
    fn dropped_call_answers_once() {
        let (pending, _, mut rx) = call(6);
        drop(pending);
        assert!(matches!(
            rx.try_next().unwrap(),
            Some(Outbound::Response { key: 6, exception: true, .. })
        ));
        assert!(rx.try_next().unwrap().is_none());
    }
}
