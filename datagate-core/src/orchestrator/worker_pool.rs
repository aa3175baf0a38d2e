use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use async_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use super::RuntimeWrapper;
use crate::config::{PoolConfig, RuntimeConfig};

/// Longest stretch a worker runs queued jobs back to back before parking its runtime.
const YIELD_BUDGET: Duration = Duration::from_millis(1);

/// A unit of work executed on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Bounded-concurrency executor shared by every connection.
///
/// The pool owns `worker_threads` OS threads, each running its own monoio runtime and pulling
/// jobs from one shared queue. The queue is unbounded; the number of threads is the bound on
/// simultaneously running jobs. Because jobs run inside a runtime, a job may `monoio::spawn`
/// local follow-up work (for example a timer that later completes a promise). That work is
/// polled whenever the thread waits for its next job, and between jobs once a worker has run
/// for [`YIELD_BUDGET`] with more jobs still queued.
///
/// # Shutdown
///
/// [`WorkerPool::shutdown`] closes the queue. Workers finish the jobs already queued and exit;
/// the call returns once every thread has been joined.
pub struct WorkerPool {
    handle: PoolHandle,
    threads: Vec<JoinHandle<()>>,
}

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    tx: Sender<Job>,
}

impl PoolHandle {
    /// Queue a job. Never waits: the queue is unbounded.
    pub fn submit(&self, job: Job) -> Result<(), PoolClosed> {
        self.tx.try_send(job).map_err(|_| PoolClosed)
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl WorkerPool {
    pub fn start(runtime_config: &RuntimeConfig, pool_config: PoolConfig) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let runtime_config = Arc::new(runtime_config.clone());
        let size = pool_config.worker_threads.max(1);
        let threads = (0..size)
            .map(|worker_id| {
                let rx = rx.clone();
                let runtime_config = runtime_config.clone();
                std::thread::Builder::new()
                    .name(format!("datagate-worker-{worker_id}"))
                    .spawn(move || {
                        let mut runtime = match RuntimeWrapper::new(runtime_config.as_ref()) {
                            Ok(runtime) => runtime,
                            Err(e) => {
                                error!("build runtime for worker {worker_id} failed: {e}");
                                return;
                            }
                        };
                        runtime.block_on(run_worker(worker_id, rx));
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        info!("worker pool started with {size} thread(s)");
        Ok(Self {
            handle: PoolHandle { tx },
            threads,
        })
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    pub fn shutdown(self) {
        self.handle.tx.close();
        for thread in self.threads {
            if thread.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(worker_id: usize, rx: Receiver<Job>) {
    debug!("worker {worker_id} started");
    let mut busy_since = Instant::now();
    while let Ok(job) = rx.recv().await {
        job();
        if rx.is_empty() {
            busy_since = Instant::now();
        } else if busy_since.elapsed() >= YIELD_BUDGET {
            // timers and spawned tasks only advance while the runtime parks
            monoio::time::sleep(Duration::from_nanos(1)).await;
            busy_since = Instant::now();
        }
    }
    debug!("worker {worker_id} exit");
}
