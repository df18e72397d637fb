use std::sync::Arc;

use log::debug;

use super::{BatchQueue, BatchSettings, TransferFuture, TransferTask};
use crate::io::{generate_meta, StreamProvider};
use crate::pool::WorkerPool;
use crate::{BatchItem, Client, Error, LinkType, Links, Meta, Operation, Result};

/// Uploads an object to its batch `upload` link and verifies it.
#[derive(Debug, Default)]
pub struct UploadTask;

impl TransferTask for UploadTask {
    type Payload = Box<dyn StreamProvider>;
    type Output = Meta;

    fn operation(&self) -> Operation {
        Operation::Upload
    }

    fn prepare(&self, meta: &Meta, item: &BatchItem) -> Option<Result<Meta>> {
        if item.link(LinkType::Download).is_some() {
            debug!("{} is already stored", meta.oid);
            return Some(Ok(meta.clone()));
        }
        if item.link(LinkType::Upload).is_none() {
            return Some(Err(Error::Protocol(format!(
                "upload link not found for {}",
                meta.oid
            ))));
        }
        None
    }

    fn transfer(
        &self,
        client: &Client,
        meta: &Meta,
        provider: &Self::Payload,
        item: &BatchItem,
    ) -> Result<Meta> {
        client.put_object_links(&**provider, meta, item)?;
        Ok(meta.clone())
    }
}

/// Batched uploads. Each future resolves with the uploaded object's meta.
#[derive(Clone)]
pub struct BatchUploader {
    queue: BatchQueue<UploadTask>,
}

impl BatchUploader {
    pub fn new(client: Client, pool: Arc<WorkerPool>, settings: BatchSettings) -> Self {
        BatchUploader {
            queue: BatchQueue::new(client, pool, settings, UploadTask),
        }
    }

    /// Upload an object whose identity is already known.
    pub fn upload<P>(&self, meta: Meta, provider: P) -> TransferFuture<Meta>
    where
        P: StreamProvider + 'static,
    {
        self.queue.enqueue(meta, Box::new(provider))
    }

    /// Hash the stream on the calling thread, then upload it.
    pub fn upload_stream<P>(&self, provider: P) -> Result<TransferFuture<Meta>>
    where
        P: StreamProvider + 'static,
    {
        let meta = generate_meta(&provider)?;
        Ok(self.upload(meta, provider))
    }

    pub fn queue(&self) -> &BatchQueue<UploadTask> {
        &self.queue
    }
}
