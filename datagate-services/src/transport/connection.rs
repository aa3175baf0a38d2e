//! One physical client connection.
//!
//! After the handshake the connection runs two tasks on its thread:
//!
//! - the reader (the service call itself) decodes frames, opens their payloads with the
//!   connection's cryptor and hands requests to the [`Dispatcher`];
//! - the writer drains [`Outbound`] messages, which may come from any worker thread, seals them
//!   and writes them to the socket.
//!
//! Both share the in-flight table: the reader adds a correlation key when it dispatches a
//! request, the writer removes it once the single response for it has been written (or the
//! cancelled call finished). A key may only be reused after that.
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::Display,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use datagate_core::{
    config::TransportConfig,
    crypto::Cryptor,
    session::SessionBinding,
    RpcError,
};
use futures::StreamExt;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use monoio::io::{AsyncReadRent, AsyncWriteRent, Split, Splitable};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, Service,
};
use tracing::{debug, error, info, trace, warn};

use super::{
    frame::Envelope,
    handshake::{negotiate, HandshakeError},
    io::{read_frame, write_frame, ReadError},
};
use crate::{
    dispatch::{Caller, Dispatcher},
    pending::{Outbound, PendingCall},
};

type InFlight = Rc<RefCell<HashMap<u64, Arc<AtomicBool>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub encryption: bool,
    pub handshake_timeout: Duration,
    // Close the connection if no frame arrives within this time.
    pub keepalive_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl From<&TransportConfig> for TransportSettings {
    fn from(value: &TransportConfig) -> Self {
        Self {
            encryption: value.encryption,
            handshake_timeout: value.handshake_timeout(),
            keepalive_timeout: value.keepalive_timeout(),
            max_frame_size: value.max_frame_size,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct ConnectionService<D> {
    dispatcher: D,
    settings: TransportSettings,
}

impl<D> ConnectionService<D> {
    pub fn new(dispatcher: D, settings: TransportSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }
}

impl<S, A> Service<(S, A)> for ConnectionService<Dispatcher>
where
    S: Split + AsyncReadRent + AsyncWriteRent + 'static,
    A: Display,
{
    type Response = ();
    type Error = ConnectionError;

    async fn call(&self, (mut stream, addr): (S, A)) -> Result<Self::Response, Self::Error> {
        let peer: Arc<str> = Arc::from(addr.to_string());
        let settings = &self.settings;
        let cryptor = match negotiate(
            &mut stream,
            settings.encryption,
            settings.handshake_timeout,
            settings.max_frame_size,
        )
        .await
        {
            Ok(cryptor) => cryptor,
            Err(e) => {
                if let Some(key) = e.offending_key() {
                    // nothing is encrypted yet, the refusal goes out in the clear
                    let reason = format!("{e}");
                    if let Some(frame) = self.protocol_error(key, &reason) {
                        let _ = write_frame(&mut stream, frame).await;
                    }
                }
                let _ = stream.shutdown().await;
                return Err(e.into());
            }
        };
        debug!("connection {peer} established");

        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = unbounded();
        let in_flight: InFlight = Default::default();
        let writer = monoio::spawn(write_loop(writer, rx, cryptor.clone(), in_flight.clone()));

        let caller = Caller {
            peer: peer.clone(),
            binding: SessionBinding::default(),
        };
        let result = self
            .read_loop(&mut reader, &caller, &tx, cryptor.as_ref(), &in_flight)
            .await;
        match &result {
            Err(Failure::Protocol { key, reason }) => {
                warn!("closing connection {peer}: {reason}");
                let abort = self
                    .dispatcher
                    .codec()
                    .encode_error(&RpcError::protocol(reason.as_str()).to_wire());
                let message = match abort {
                    Ok(payload) => Outbound::Abort { key: *key, payload },
                    Err(_) => Outbound::Shutdown,
                };
                let _ = tx.unbounded_send(message);
            }
            _ => {
                let _ = tx.unbounded_send(Outbound::Shutdown);
            }
        }
        drop(tx);
        writer.await;

        if let Some(id) = caller.binding.current() {
            // the session outlives the socket so the client can assert it elsewhere
            debug!("connection {peer} closed, session {id} left to expire");
        }
        match result {
            Ok(()) => Ok(()),
            Err(Failure::Protocol { reason, .. }) => Err(ConnectionError::Protocol(reason)),
            Err(Failure::Io(e)) => Err(ConnectionError::Io(e)),
        }
    }
}

enum Failure {
    Protocol { key: u64, reason: String },
    Io(std::io::Error),
}

impl Failure {
    fn protocol(key: u64, reason: impl Into<String>) -> Self {
        Failure::Protocol {
            key,
            reason: reason.into(),
        }
    }
}

impl ConnectionService<Dispatcher> {
    async fn read_loop<R: AsyncReadRent>(
        &self,
        reader: &mut R,
        caller: &Caller,
        tx: &UnboundedSender<Outbound>,
        cryptor: &dyn Cryptor,
        in_flight: &InFlight,
    ) -> Result<(), Failure> {
        let max_frame_size = self.settings.max_frame_size;
        loop {
            let next = match self.settings.keepalive_timeout {
                Some(keepalive) => {
                    match monoio::time::timeout(keepalive, read_frame(reader, max_frame_size)).await
                    {
                        Ok(next) => next,
                        Err(_) => {
                            info!("connection {} keepalive timed out", caller.peer);
                            return Ok(());
                        }
                    }
                }
                None => read_frame(reader, max_frame_size).await,
            };
            let mut envelope = match next {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    trace!("connection {} closed by peer", caller.peer);
                    return Ok(());
                }
                Err(ReadError::Io(e)) => return Err(Failure::Io(e)),
                Err(ReadError::Frame(e)) => return Err(Failure::protocol(0, e.to_string())),
            };
            let key = envelope.correlation_key;

            if envelope.is_handshake() {
                return Err(Failure::protocol(key, "handshake already completed"));
            }
            if envelope.is_exception() {
                return Err(Failure::protocol(key, "exception flag set on a request"));
            }
            let aad = envelope
                .aad()
                .map_err(|e| Failure::protocol(key, e.to_string()))?;
            envelope.payload = cryptor
                .open(&aad, &envelope.payload)
                .map_err(|e| Failure::protocol(key, e.to_string()))?;

            if envelope.is_cancel() {
                match in_flight.borrow().get(&key) {
                    Some(cancelled) => {
                        debug!("call {key} on {} cancelled", caller.peer);
                        cancelled.store(true, Ordering::Release);
                    }
                    None => trace!("cancel for unknown call {key} ignored"),
                }
                continue;
            }

            let cancelled = {
                let mut in_flight = in_flight.borrow_mut();
                if in_flight.contains_key(&key) {
                    return Err(Failure::protocol(
                        key,
                        format!("correlation key {key} is already in flight"),
                    ));
                }
                let cancelled = Arc::new(AtomicBool::new(false));
                in_flight.insert(key, cancelled.clone());
                cancelled
            };
            let pending = PendingCall::new(
                key,
                cancelled,
                tx.clone(),
                self.dispatcher.codec().clone(),
            );
            self.dispatcher.dispatch(envelope, caller, pending);
        }
    }

    fn protocol_error(&self, key: u64, reason: &str) -> Option<Bytes> {
        let payload = self
            .dispatcher
            .codec()
            .encode_error(&RpcError::protocol(reason).to_wire())
            .ok()?;
        Envelope::response(key, true, payload).encode().ok()
    }
}

async fn write_loop<W: AsyncWriteRent>(
    mut io: W,
    mut rx: UnboundedReceiver<Outbound>,
    cryptor: Rc<dyn Cryptor>,
    in_flight: InFlight,
) {
    while let Some(message) = rx.next().await {
        let (key, exception, payload, last) = match message {
            Outbound::Response {
                key,
                exception,
                payload,
            } => (key, exception, payload, false),
            Outbound::Retire(key) => {
                in_flight.borrow_mut().remove(&key);
                continue;
            }
            Outbound::Abort { key, payload } => (key, true, payload, true),
            Outbound::Shutdown => break,
        };
        let mut envelope = Envelope::response(key, exception, Bytes::new());
        let sealed = envelope
            .aad()
            .map_err(|e| e.to_string())
            .and_then(|aad| cryptor.seal(&aad, &payload).map_err(|e| e.to_string()));
        envelope.payload = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("seal response {key} failed: {e}");
                break;
            }
        };
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("encode response {key} failed: {e}");
                break;
            }
        };
        if let Err(e) = write_frame(&mut io, frame).await {
            warn!("write response {key} failed: {e}");
            break;
        }
        in_flight.borrow_mut().remove(&key);
        trace!("response {key} sent");
        if last {
            break;
        }
    }
    let _ = io.shutdown().await;
}

impl<F> ConnectionService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<TransportSettings>,
    {
        layer_fn(|c: &C, inner| Self::new(inner, c.param()))
    }
}

impl<F> MakeService for ConnectionService<F>
where
    F: MakeService,
{
    type Service = ConnectionService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionService {
            dispatcher: self.dispatcher.make_via_ref(old.map(|o| &o.dispatcher))?,
            settings: self.settings,
        })
    }
}
