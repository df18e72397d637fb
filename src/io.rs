//! Object content streams.
//!
//! Uploads read from a [`StreamProvider`], downloads are consumed by a
//! [`StreamHandler`]. Downloaded bytes always pass through a
//! [`ValidatingReader`] so that callers never observe content whose hash or
//! size differs from the object identity.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{Error, Meta, Result};

/// Produces a fresh readable stream of object content.
///
/// May be invoked several times: every retried PUT opens a new stream.
pub trait StreamProvider: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// Consumes a downloaded object stream and produces a result.
pub trait StreamHandler<T>: Send + Sync {
    fn handle(&self, stream: &mut dyn Read) -> Result<T>;
}

impl<T, F> StreamHandler<T> for F
where
    F: Fn(&mut dyn Read) -> Result<T> + Send + Sync,
{
    fn handle(&self, stream: &mut dyn Read) -> Result<T> {
        self(stream)
    }
}

/// Stream provider over in-memory content.
#[derive(Debug, Clone)]
pub struct ByteStreamProvider {
    data: Arc<[u8]>,
}

impl ByteStreamProvider {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        ByteStreamProvider {
            data: Arc::from(data.into()),
        }
    }
}

impl From<&str> for ByteStreamProvider {
    fn from(data: &str) -> Self {
        Self::new(data.as_bytes())
    }
}

impl From<Vec<u8>> for ByteStreamProvider {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl StreamProvider for ByteStreamProvider {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(ArcBytes(self.data.clone()))))
    }
}

struct ArcBytes(Arc<[u8]>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Stream provider reading a file from disk.
#[derive(Debug, Clone)]
pub struct FileStreamProvider {
    path: PathBuf,
}

impl FileStreamProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStreamProvider {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StreamProvider for FileStreamProvider {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Compute the object identity (SHA256 oid and size) of a stream.
pub fn generate_meta(provider: &dyn StreamProvider) -> Result<Meta> {
    let mut stream = provider.open()?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 0x10000];
    let mut size: i64 = 0;
    loop {
        let read = stream.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as i64;
    }
    Ok(Meta::new(hex::encode(hasher.finalize()), size))
}

/// Reader that checks downloaded content against its object identity.
///
/// Fails with [`Error::Integrity`] (wrapped in `io::Error`) when more bytes
/// than declared arrive, when the stream ends early, or when the final
/// SHA256 differs from the oid. A declared size of `-1` skips size checks.
pub struct ValidatingReader<R> {
    inner: R,
    meta: Meta,
    hasher: Sha256,
    total: u64,
    eof: bool,
    /// First integrity failure, returned again by every later read.
    failure: Option<Error>,
}

impl<R: Read> ValidatingReader<R> {
    pub fn new(inner: R, meta: Meta) -> Self {
        ValidatingReader {
            inner,
            meta,
            hasher: Sha256::new(),
            total: 0,
            eof: false,
            failure: None,
        }
    }

    fn declared_size(&self) -> Option<u64> {
        u64::try_from(self.meta.size).ok()
    }

    fn finish(&mut self) -> io::Result<()> {
        self.eof = true;
        if let Some(size) = self.declared_size() {
            if self.total != size {
                return Err(self.fail(format!(
                    "unexpected end of stream for {}: got {} of {} bytes",
                    self.meta.oid, self.total, size
                )));
            }
        }
        let hash = hex::encode(self.hasher.finalize_reset());
        let expected = self.meta.oid.strip_prefix("sha256:").unwrap_or(&self.meta.oid);
        if !hash.eq_ignore_ascii_case(expected) {
            let message = format!("invalid stream hash: expected {}, got {}", expected, hash);
            return Err(self.fail(message));
        }
        Ok(())
    }

    fn fail(&mut self, message: String) -> io::Error {
        let err = Error::Integrity(message);
        self.failure = Some(err.clone());
        err.into()
    }
}

impl<R: Read> Read for ValidatingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = &self.failure {
            return Err(err.clone().into());
        }
        if self.eof || buf.is_empty() {
            return Ok(0);
        }
        let read = self.inner.read(buf)?;
        if read == 0 {
            self.finish()?;
            return Ok(0);
        }
        self.hasher.update(&buf[..read]);
        self.total += read as u64;
        if let Some(size) = self.declared_size() {
            if self.total > size {
                return Err(self.fail(format!(
                    "stream too big for {}: more than {} bytes",
                    self.meta.oid, size
                )));
            }
        }
        Ok(read)
    }
}
