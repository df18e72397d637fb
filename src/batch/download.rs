use std::marker::PhantomData;
use std::sync::Arc;

use super::{BatchQueue, BatchSettings, TransferFuture, TransferTask};
use crate::io::StreamHandler;
use crate::pool::WorkerPool;
use crate::{BatchItem, Client, Error, LinkType, Links, Meta, Operation, Result};

/// Downloads an object from its batch `download` link.
pub struct DownloadTask<T> {
    _output: PhantomData<fn() -> T>,
}

impl<T> Default for DownloadTask<T> {
    fn default() -> Self {
        DownloadTask {
            _output: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static> TransferTask for DownloadTask<T> {
    type Payload = Box<dyn StreamHandler<T>>;
    type Output = T;

    fn operation(&self) -> Operation {
        Operation::Download
    }

    fn prepare(&self, meta: &Meta, item: &BatchItem) -> Option<Result<T>> {
        match item.link(LinkType::Download) {
            Some(_) => None,
            None => Some(Err(Error::NotFound(meta.oid.clone()))),
        }
    }

    fn transfer(
        &self,
        client: &Client,
        meta: &Meta,
        handler: &Self::Payload,
        item: &BatchItem,
    ) -> Result<T> {
        client.get_object_links(Some(meta), item, &**handler)
    }
}

/// Batched downloads.
///
/// The handler receives the object content, validated against `meta`.
pub struct BatchDownloader<T: Clone + Send + 'static> {
    queue: BatchQueue<DownloadTask<T>>,
}

impl<T: Clone + Send + 'static> Clone for BatchDownloader<T> {
    fn clone(&self) -> Self {
        BatchDownloader {
            queue: self.queue.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> BatchDownloader<T> {
    pub fn new(client: Client, pool: Arc<WorkerPool>, settings: BatchSettings) -> Self {
        BatchDownloader {
            queue: BatchQueue::new(client, pool, settings, DownloadTask::default()),
        }
    }

    pub fn download<H>(&self, meta: Meta, handler: H) -> TransferFuture<T>
    where
        H: StreamHandler<T> + 'static,
    {
        self.queue.enqueue(meta, Box::new(handler))
    }

    pub fn queue(&self) -> &BatchQueue<DownloadTask<T>> {
        &self.queue
    }
}
