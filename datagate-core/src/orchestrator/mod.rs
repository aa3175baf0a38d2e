//! Thread and runtime management for the transport.
//!
//! Two kinds of threads are managed here:
//!
//! - I/O threads ([`IoManager`]): each runs its own monoio runtime, builds its own listener and
//!   serves every accepted connection as a local task. Reading, decrypting, dispatching and
//!   writing frames for a connection all happen on the thread that accepted it.
//! - Worker threads ([`WorkerPool`]): a fixed set of threads, shared by every connection, that
//!   execute invocations. The number of threads bounds how many invocations run at once while
//!   the queue in front of them is unbounded.
//!
//! Both kinds of thread are built on [`RuntimeWrapper`], which picks io_uring when the host
//! supports it and falls back to the legacy driver otherwise.
use std::{fmt::Debug, rc::Rc, sync::Arc, thread::JoinHandle};

use futures_channel::oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender};
use monoio::{io::stream::Stream, utils::bind_to_cpu_set};
use service_async::{MakeService, Service};
use tracing::{debug, error, info, warn};

use crate::{
    config::RuntimeConfig,
    listener::{AcceptedAddr, AcceptedStream, Listener},
};

mod runtime;
mod worker_pool;

pub use runtime::RuntimeWrapper;
pub use worker_pool::{Job, PoolClosed, PoolHandle, WorkerPool};

/// Serves incoming connections using the provided listener and service.
///
/// This function runs a loop that continuously accepts new connections and handles them
/// using the provided service. It can be gracefully stopped by dropping the receiving side of
/// the `stop` channel.
///
/// # Behavior
///
/// The function will run until one of the following occurs:
/// - The `stop` channel is cancelled, indicating a graceful shutdown.
/// - The listener closes, indicating no more incoming connections.
///
/// For each accepted connection, a new task is spawned to handle it using the provided service.
pub async fn serve<S, Svc, A, E>(mut listener: S, handler: Rc<Svc>, mut stop: OSender<()>)
where
    S: Stream<Item = Result<A, E>> + 'static,
    E: Debug,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                info!("server is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        let svc = handler.clone();
                        monoio::spawn(async move {
                            match svc.call(accept).await {
                                Ok(_) => {
                                    debug!("Connection complete");
                                }
                                Err(e) => {
                                    error!("Connection error: {e:?}");
                                }
                            }
                        });
                    }
                    Err(e) => warn!("Accept connection failed: {e:?}"),
                }
            }
        }
    }
}

/// Handle to a running I/O thread. Dropping `stop` asks the thread's accept loop to exit.
pub struct IoThread {
    pub join: JoinHandle<()>,
    pub stop: OReceiver<()>,
}

/// Spawns and binds the I/O threads described by a [`RuntimeConfig`].
pub struct IoManager {
    runtime_config: RuntimeConfig,
}

impl IoManager {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self { runtime_config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    /// Start one I/O thread per configured worker. Each thread builds its own listener from
    /// `listener_factory` and its own connection service from `factory`.
    pub fn spawn<LF, F>(
        &self,
        listener_factory: Arc<LF>,
        factory: Arc<F>,
    ) -> std::io::Result<Vec<IoThread>>
    where
        LF: MakeService<Service = Listener> + Send + Sync + 'static,
        LF::Error: Debug,
        F: MakeService + Send + Sync + 'static,
        F::Error: Debug,
        F::Service: Service<(AcceptedStream, AcceptedAddr)> + 'static,
        <F::Service as Service<(AcceptedStream, AcceptedAddr)>>::Error: Debug,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        let runtime_config = Arc::new(self.runtime_config.clone());
        (0..self.runtime_config.worker_threads)
            .map(|worker_id| {
                let runtime_config = runtime_config.clone();
                let listener_factory = listener_factory.clone();
                let factory = factory.clone();
                let (stop_tx, stop_rx) = ochannel::<()>();
                let join = std::thread::Builder::new()
                    .name(format!("datagate-io-{worker_id}"))
                    .spawn(move || {
                        // bind thread to cpu core
                        if let Some(cores) = cores {
                            let core = worker_id % cores.get();
                            if let Err(e) = bind_to_cpu_set([core]) {
                                warn!("bind thread {worker_id} to core {core} failed: {e}");
                            }
                        }
                        let mut runtime = match RuntimeWrapper::new(runtime_config.as_ref()) {
                            Ok(runtime) => runtime,
                            Err(e) => {
                                error!("build runtime for io thread {worker_id} failed: {e}");
                                return;
                            }
                        };
                        runtime.block_on(async move {
                            let listener = match listener_factory.make() {
                                Ok(l) => l,
                                Err(e) => {
                                    error!("create listener on io thread {worker_id}: {e:?}");
                                    return;
                                }
                            };
                            let svc = match factory.make() {
                                Ok(svc) => svc,
                                Err(e) => {
                                    error!("create service on io thread {worker_id} failed: {e:?}");
                                    return;
                                }
                            };
                            serve(listener, Rc::new(svc), stop_tx).await;
                        });
                    })?;
                Ok(IoThread {
                    join,
                    stop: stop_rx,
                })
            })
            .collect()
    }
}
