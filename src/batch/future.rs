use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::{Error, Result};

struct Completion<R> {
    result: Mutex<Option<Result<R>>>,
    done: Condvar,
}

/// Handle to the eventual result of a queued transfer.
///
/// Clones share the same result. The first resolution wins; later ones
/// (a cancelled transfer finishing, say) are ignored.
pub struct TransferFuture<R> {
    inner: Arc<Completion<R>>,
}

impl<R> Clone for TransferFuture<R> {
    fn clone(&self) -> Self {
        TransferFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<R> TransferFuture<R> {
    pub(crate) fn new() -> Self {
        TransferFuture {
            inner: Arc::new(Completion {
                result: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// Resolve the future. Returns `false` if it was already resolved.
    pub(crate) fn complete(&self, result: Result<R>) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.inner.done.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        self.lock().is_some()
    }

    /// Resolve with [`Error::Cancelled`] unless already resolved.
    pub fn cancel(&self) -> bool {
        self.complete(Err(Error::Cancelled))
    }

    /// Whether both handles refer to the same transfer.
    pub fn same_as(&self, other: &TransferFuture<R>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Result<R>>> {
        self.inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Clone> TransferFuture<R> {
    /// Block until the transfer completes.
    pub fn wait(&self) -> Result<R> {
        let mut slot = self.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self
                .inner
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the transfer completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        let (slot, _) = self
            .inner
            .done
            .wait_timeout_while(self.lock(), timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    /// The result, if the transfer has completed.
    pub fn try_result(&self) -> Option<Result<R>> {
        self.lock().clone()
    }
}

impl<R> fmt::Debug for TransferFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferFuture")
            .field("done", &self.is_done())
            .finish()
    }
}
