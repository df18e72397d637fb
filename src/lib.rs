//! # gitlfs-client
//!
//! Client for the Git LFS (Large File Storage) HTTP protocol.
//!
//! This crate provides:
//! - Credential providers for HTTP basic auth and `git-lfs-authenticate` over SSH
//! - A request executor with redirect following, retries and credential rotation
//! - Single-object upload/download on top of the LFS API
//! - Batched, deduplicated transfers running on a worker pool
//!
//! ## Example
//!
//! ```no_run
//! use std::io::Read;
//! use std::sync::Arc;
//! use gitlfs_client::{BatchDownloader, BatchSettings, Client, Meta, WorkerPool};
//!
//! let client = Client::from_git_url("https://github.com/owner/repo.git").unwrap();
//! let pool = Arc::new(WorkerPool::new(4).unwrap());
//! let downloader = BatchDownloader::new(client, pool.clone(), BatchSettings::default());
//!
//! let meta = Meta::new(
//!     "4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393",
//!     12345,
//! );
//! let future = downloader.download(meta, |stream: &mut dyn Read| -> gitlfs_client::Result<Vec<u8>> {
//!     let mut content = Vec::new();
//!     stream.read_to_end(&mut content)?;
//!     Ok(content)
//! });
//! let content = future.wait().unwrap();
//! println!("downloaded {} bytes", content.len());
//! pool.shutdown();
//! ```

mod auth;
mod batch;
mod client;
mod error;
pub mod http;
pub mod io;
mod pool;
mod protocol;
pub mod request;

#[cfg(test)]
mod testing;

pub use auth::{
    create_auth_provider, join_url, AuthProvider, BasicAuthProvider, CachedAuthProvider,
    CommandRunner, CredentialSource, ExternalAuthProvider, ProcessRunner, SshAuthenticate,
};
pub use batch::{
    BatchDownloader, BatchQueue, BatchSettings, BatchUploader, DownloadTask, TransferFuture,
    TransferTask, UploadTask,
};
pub use client::{Client, ClosePolicy, MAX_AUTH_COUNT, MAX_REDIRECT_COUNT, MAX_RETRY_COUNT};
pub use error::{Error, Result};
pub use io::{ByteStreamProvider, FileStreamProvider, StreamHandler, StreamProvider};
pub use pool::WorkerPool;
pub use protocol::{
    BatchItem, BatchRequest, BatchResponse, Credential, Link, LinkType, Links, Meta, ObjectRes,
    Operation, ServerError, BATCH_SIZE, MIME_BINARY, MIME_LFS_JSON,
};
