use std::{mem, sync::Arc};

use parking_lot::Mutex;

use super::CallResult;
use crate::RpcError;

type Callback = Box<dyn FnOnce(CallResult) + Send + 'static>;

enum Slot {
    Waiting,
    Callback(Callback),
    Done(CallResult),
    Consumed,
}

struct Shared {
    slot: Mutex<Slot>,
}

impl Shared {
    fn complete(&self, result: CallResult) {
        let mut slot = self.slot.lock();
        match mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Waiting => *slot = Slot::Done(result),
            Slot::Callback(cb) => {
                drop(slot);
                cb(result);
            }
            // completing twice is impossible through the public API
            other => *slot = other,
        }
    }
}

/// Create a linked producer/consumer pair for a result that is not available yet.
pub fn promise() -> (Promise, ResultFuture) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Waiting),
    });
    (
        Promise {
            shared: Some(shared.clone()),
        },
        ResultFuture { shared },
    )
}

/// Producer side. Completing consumes it, so a result is delivered at most once; dropping it
/// uncompleted delivers an internal error, so a result is delivered at least once.
pub struct Promise {
    shared: Option<Arc<Shared>>,
}

impl Promise {
    pub fn complete(mut self, result: CallResult) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(RpcError::internal(
                "promise dropped without being completed",
            )));
        }
    }
}

/// Consumer side. The continuation runs on whichever thread completes the promise, or
/// immediately if the result is already there.
pub struct ResultFuture {
    shared: Arc<Shared>,
}

impl ResultFuture {
    /// An already completed future.
    pub fn ready(result: CallResult) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Done(result)),
            }),
        }
    }

    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        match mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Done(result) => {
                drop(slot);
                callback(result);
            }
            Slot::Waiting => *slot = Slot::Callback(Box::new(callback)),
            other => *slot = other,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Done(_))
    }
}
