//! Batched transfers.
//!
//! A [`BatchQueue`] collects object transfers requested from any thread,
//! groups them into Batch API calls and runs the per-object transfers on a
//! [`WorkerPool`]. Concurrent requests for the same oid share one transfer.
//!
//! The flow for one object:
//!
//! 1. `enqueue` inserts a pending entry (or returns the existing future).
//! 2. A batch job drains up to `limit` eligible entries, in insertion order,
//!    and posts them to `objects/batch` with the shared credential.
//! 3. Each returned item is either resolved right away (`prepare`) or
//!    dispatched to the pool as an in-flight transfer.
//! 4. A failed transfer makes the entry eligible again until it runs out of
//!    attempts; the next batch picks it up with fresh links.

mod download;
mod future;
mod upload;

pub use download::{BatchDownloader, DownloadTask};
pub use future::TransferFuture;
pub use upload::{BatchUploader, UploadTask};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::pool::WorkerPool;
use crate::protocol::BATCH_SIZE;
use crate::{BatchItem, BatchRequest, BatchResponse, Client, Credential, Error, Meta, Operation, Result};

/// Batch queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Maximum objects per batch request.
    pub limit: usize,
    /// No new batch is started while more transfers than this are in flight.
    pub threshold: usize,
    /// Attempts per object before its failure is reported.
    pub retry_count: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            limit: BATCH_SIZE,
            threshold: 10,
            retry_count: 3,
        }
    }
}

impl BatchSettings {
    /// Set the batch size. Values below 1 are raised to 1.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Set how many in-flight transfers hold back new batches. 0 allows
    /// a new batch only when nothing is in flight.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the attempts per object. Values below 1 are raised to 1.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.max(1);
        self
    }

    fn normalized(self) -> Self {
        self.with_limit(self.limit).with_retry_count(self.retry_count)
    }
}

/// Operation-specific part of a batched transfer.
pub trait TransferTask: Send + Sync + 'static {
    /// Caller-supplied data for one object (content source, consumer).
    type Payload: Send + Sync + 'static;
    type Output: Clone + Send + 'static;

    fn operation(&self) -> Operation;

    /// Inspect a batch item before transferring.
    ///
    /// `Some` resolves the transfer immediately with that result.
    fn prepare(&self, meta: &Meta, item: &BatchItem) -> Option<Result<Self::Output>>;

    /// Transfer one object using the links of `item`.
    fn transfer(
        &self,
        client: &Client,
        meta: &Meta,
        payload: &Self::Payload,
        item: &BatchItem,
    ) -> Result<Self::Output>;
}

struct PendingTransfer<S: TransferTask> {
    meta: Meta,
    payload: S::Payload,
    future: TransferFuture<S::Output>,
    seq: u64,
    /// Credential of the batch that dispatched this transfer; `None` while
    /// waiting for a batch.
    auth: Mutex<Option<Arc<Credential>>>,
    attempts: AtomicU32,
}

impl<S: TransferTask> PendingTransfer<S> {
    fn auth(&self) -> Option<Arc<Credential>> {
        self.auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_auth(&self, auth: Option<Arc<Credential>>) {
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = auth;
    }

    fn is_eligible(&self) -> bool {
        !self.future.is_done() && self.auth().is_none()
    }
}

struct Shared<S: TransferTask> {
    client: Client,
    pool: Arc<WorkerPool>,
    settings: BatchSettings,
    task: S,
    pending: DashMap<String, Arc<PendingTransfer<S>>>,
    sequence: AtomicU64,
    in_flight: AtomicUsize,
    batch_in_progress: AtomicBool,
    /// Credential used for batch requests. Never locked across I/O.
    credential: Mutex<Option<Arc<Credential>>>,
}

/// Deduplicating queue that groups transfers into batch requests.
pub struct BatchQueue<S: TransferTask> {
    shared: Arc<Shared<S>>,
}

impl<S: TransferTask> Clone for BatchQueue<S> {
    fn clone(&self) -> Self {
        BatchQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<S: TransferTask> BatchQueue<S> {
    pub fn new(client: Client, pool: Arc<WorkerPool>, settings: BatchSettings, task: S) -> Self {
        BatchQueue {
            shared: Arc::new(Shared {
                client,
                pool,
                settings: settings.normalized(),
                task,
                pending: DashMap::new(),
                sequence: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                batch_in_progress: AtomicBool::new(false),
                credential: Mutex::new(None),
            }),
        }
    }

    /// Queue a transfer.
    ///
    /// While a transfer for the same oid is unresolved, its future is
    /// returned and `payload` is dropped.
    pub fn enqueue(&self, meta: Meta, payload: S::Payload) -> TransferFuture<S::Output> {
        let shared = &self.shared;
        let transfer = Arc::new(PendingTransfer {
            seq: shared.sequence.fetch_add(1, Ordering::SeqCst),
            meta,
            payload,
            future: TransferFuture::new(),
            auth: Mutex::new(None),
            attempts: AtomicU32::new(0),
        });

        let future = match shared.pending.entry(transfer.meta.oid.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().future.is_done() {
                    return entry.get().future.clone();
                }
                let future = transfer.future.clone();
                entry.insert(transfer);
                future
            }
            Entry::Vacant(entry) => {
                let future = transfer.future.clone();
                entry.insert(transfer);
                future
            }
        };

        shared.try_submit();
        future
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.shared.settings
    }

    pub fn client(&self) -> &Client {
        &self.shared.client
    }

    /// Number of entries not yet removed from the queue.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Number of per-object transfers currently running or queued on the pool.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }
}

impl<S: TransferTask> Shared<S> {
    fn try_submit(self: &Arc<Self>) {
        if self.pool.is_shutdown() {
            self.fail_all(Error::Shutdown);
            return;
        }
        if self.in_flight.load(Ordering::SeqCst) > self.settings.threshold {
            return;
        }
        if !self.pending.iter().any(|entry| entry.value().is_eligible()) {
            return;
        }
        if self
            .batch_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let shared = self.clone();
        let name = format!("{} batch", self.task.operation().as_str());
        let submitted = self.pool.execute(&name, move || {
            let _guard = BatchGuard(shared.clone());
            shared.submit_batch();
        });
        if !submitted {
            self.batch_in_progress.store(false, Ordering::SeqCst);
            self.fail_all(Error::Shutdown);
        }
    }

    fn fail_all(&self, err: Error) {
        let transfers: Vec<_> = self
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for transfer in transfers {
            self.finish(&transfer, Err(err.clone()));
        }
    }

    /// Resolve a transfer and drop it from the queue.
    fn finish(&self, transfer: &Arc<PendingTransfer<S>>, result: Result<S::Output>) {
        transfer.future.complete(result);
        self.forget(transfer);
    }

    fn forget(&self, transfer: &Arc<PendingTransfer<S>>) {
        self.pending
            .remove_if(&transfer.meta.oid, |_, current| Arc::ptr_eq(current, transfer));
    }

    /// Take up to `limit` eligible entries in insertion order.
    ///
    /// Resolved entries that are not in flight are removed on the way.
    fn drain(&self) -> Vec<Arc<PendingTransfer<S>>> {
        let mut eligible = Vec::new();
        let mut stale = Vec::new();
        for entry in self.pending.iter() {
            let transfer = entry.value();
            if transfer.auth().is_some() {
                continue;
            }
            if transfer.future.is_done() {
                stale.push(transfer.clone());
            } else {
                eligible.push(transfer.clone());
            }
        }
        for transfer in &stale {
            self.forget(transfer);
        }

        eligible.sort_by_key(|transfer| transfer.seq);
        eligible.truncate(self.settings.limit);
        eligible
    }

    /// Shared batch credential, fetched on first use.
    fn credential(&self) -> Result<Arc<Credential>> {
        if let Some(auth) = self.lock_credential().clone() {
            return Ok(auth);
        }
        let fresh = Arc::new(
            self.client
                .auth_provider()
                .get_auth(self.task.operation())?,
        );
        Ok(self.lock_credential().get_or_insert(fresh).clone())
    }

    /// Drop a rejected credential. Only the first caller for a given
    /// credential invalidates it at the provider.
    ///
    /// The provider is invalidated before the slot lock is released, so a
    /// caller that finds the slot empty can't fetch the rejected credential
    /// back from the provider's cache.
    fn invalidate(&self, auth: &Arc<Credential>) {
        let mut slot = self.lock_credential();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, auth) => {
                *slot = None;
                info!("{} credentials rejected, invalidating", self.task.operation().as_str());
                self.client
                    .auth_provider()
                    .invalidate_auth(self.task.operation(), auth);
            }
            _ => {}
        }
    }

    fn lock_credential(&self) -> std::sync::MutexGuard<'_, Option<Arc<Credential>>> {
        self.credential.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit_batch(self: &Arc<Self>) {
        let batch = self.drain();
        if batch.is_empty() {
            return;
        }

        let auth = match self.credential() {
            Ok(auth) => auth,
            Err(err) => {
                warn!("can't get credentials for batch: {}", err);
                for transfer in &batch {
                    self.finish(transfer, Err(err.clone()));
                }
                return;
            }
        };

        let operation = self.task.operation();
        let request = BatchRequest::new(
            operation,
            batch.iter().map(|transfer| transfer.meta.clone()).collect(),
        );
        debug!("{} batch of {} objects", operation.as_str(), batch.len());

        match self.client.send_batch(&request, &auth) {
            Ok(response) => self.reconcile(&auth, batch, response),
            Err(err @ Error::Unauthorized { .. }) => {
                self.invalidate(&auth);
                match self.credential() {
                    Ok(fresh) if !fresh.same_access(&auth) => {
                        debug!("retrying batch with new credentials");
                    }
                    Ok(_) => {
                        for transfer in &batch {
                            self.finish(transfer, Err(err.clone()));
                        }
                    }
                    Err(fetch) => {
                        for transfer in &batch {
                            self.finish(transfer, Err(fetch.clone()));
                        }
                    }
                }
            }
            Err(err) => {
                warn!("{} batch failed: {}", operation.as_str(), err);
                for transfer in &batch {
                    self.finish(transfer, Err(err.clone()));
                }
            }
        }
    }

    fn reconcile(
        self: &Arc<Self>,
        auth: &Arc<Credential>,
        batch: Vec<Arc<PendingTransfer<S>>>,
        response: BatchResponse,
    ) {
        let mut items: HashMap<String, BatchItem> = response
            .objects
            .into_iter()
            .map(|item| (item.oid().to_string(), item))
            .collect();

        for transfer in batch {
            let oid = &transfer.meta.oid;
            match items.remove(oid) {
                None => {
                    let err = Error::Protocol(format!("batch response is missing object {}", oid));
                    self.finish(&transfer, Err(err));
                }
                Some(item) => match item.error.clone() {
                    Some(error) => self.finish(&transfer, Err(error.into_error(oid))),
                    None => self.dispatch(auth, transfer, item),
                },
            }
        }

        for oid in items.keys() {
            warn!("ignoring unexpected object {} in batch response", oid);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        auth: &Arc<Credential>,
        transfer: Arc<PendingTransfer<S>>,
        item: BatchItem,
    ) {
        if transfer.future.is_done() {
            self.forget(&transfer);
            return;
        }
        if let Some(result) = self.task.prepare(&transfer.meta, &item) {
            self.finish(&transfer, result);
            return;
        }

        transfer.set_auth(Some(auth.clone()));
        let guard = InFlight::new(self.clone(), transfer);
        let name = format!("{} {}", self.task.operation().as_str(), guard.transfer.meta.oid);
        let transfer = guard.transfer.clone();
        let submitted = self.pool.execute(&name, move || {
            guard.shared.process(&guard.transfer, &item);
        });
        if !submitted {
            self.finish(&transfer, Err(Error::Shutdown));
        }
    }

    /// Run one dispatched transfer.
    fn process(&self, transfer: &Arc<PendingTransfer<S>>, item: &BatchItem) {
        if transfer.future.is_done() {
            return;
        }
        let dispatched = match transfer.auth() {
            Some(auth) => auth,
            None => return,
        };
        let current = self.lock_credential().clone();
        if !current.map_or(false, |current| Arc::ptr_eq(&current, &dispatched)) {
            debug!("credentials changed, requeueing {}", transfer.meta.oid);
            return;
        }

        let result = self
            .task
            .transfer(&self.client, &transfer.meta, &transfer.payload, item);
        match result {
            Ok(output) => self.finish(transfer, Ok(output)),
            Err(err @ Error::Forbidden { .. }) => self.finish(transfer, Err(err)),
            Err(err @ Error::Unauthorized { .. }) => {
                self.invalidate(&dispatched);
                match self.credential() {
                    Ok(fresh) if !fresh.same_access(&dispatched) => {
                        debug!("requeueing {} with new credentials", transfer.meta.oid);
                    }
                    // Rotation gave nothing new: this is a real failure.
                    Ok(_) => self.attempt_failed(transfer, err),
                    Err(fetch) => self.finish(transfer, Err(fetch)),
                }
            }
            Err(err) => self.attempt_failed(transfer, err),
        }
    }

    fn attempt_failed(&self, transfer: &Arc<PendingTransfer<S>>, err: Error) {
        let attempts = transfer.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts >= self.settings.retry_count {
            warn!(
                "{} {} failed after {} attempts: {}",
                self.task.operation().as_str(),
                transfer.meta.oid,
                attempts,
                err
            );
            self.finish(transfer, Err(err));
        } else {
            debug!(
                "{} {} attempt {} failed: {}",
                self.task.operation().as_str(),
                transfer.meta.oid,
                attempts,
                err
            );
        }
    }
}

/// Clears the batch flag and looks for more work when a batch job ends.
struct BatchGuard<S: TransferTask>(Arc<Shared<S>>);

impl<S: TransferTask> Drop for BatchGuard<S> {
    fn drop(&mut self) {
        self.0.batch_in_progress.store(false, Ordering::SeqCst);
        self.0.try_submit();
    }
}

/// Counts a dispatched transfer in `in_flight` until its job ends.
struct InFlight<S: TransferTask> {
    shared: Arc<Shared<S>>,
    transfer: Arc<PendingTransfer<S>>,
}

impl<S: TransferTask> InFlight<S> {
    fn new(shared: Arc<Shared<S>>, transfer: Arc<PendingTransfer<S>>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { shared, transfer }
    }
}

impl<S: TransferTask> Drop for InFlight<S> {
    fn drop(&mut self) {
        if self.transfer.future.is_done() {
            self.shared.forget(&self.transfer);
        } else {
            // Back in line for the next batch.
            self.transfer.set_auth(None);
        }
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.shared.try_submit();
    }
}
