//! Caching wrapper around an expensive credential source.

use std::sync::{Mutex, PoisonError, RwLock};

use log::debug;

use super::AuthProvider;
use crate::{Credential, Error, Operation, Result};

/// Something that can produce a fresh credential, e.g. by running
/// `git-lfs-authenticate` or calling a token endpoint.
pub trait CredentialSource: Send + Sync {
    fn fetch(&self, operation: Operation) -> Result<Credential>;
}

impl<F> CredentialSource for F
where
    F: Fn(Operation) -> Result<Credential> + Send + Sync,
{
    fn fetch(&self, operation: Operation) -> Result<Credential> {
        self(operation)
    }
}

/// Per-operation cache entry.
#[derive(Default)]
struct Slot {
    /// Serializes fetches so concurrent first callers share one result.
    gate: Mutex<()>,
    cached: RwLock<Option<Credential>>,
}

impl Slot {
    fn get(&self) -> Option<Credential> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// [`AuthProvider`] that fetches a credential at most once per operation
/// until it is invalidated.
pub struct CachedAuthProvider<S> {
    source: S,
    download: Slot,
    upload: Slot,
}

impl<S: CredentialSource> CachedAuthProvider<S> {
    pub fn new(source: S) -> Self {
        CachedAuthProvider {
            source,
            download: Slot::default(),
            upload: Slot::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Drop the cache and return the underlying source.
    pub fn into_source(self) -> S {
        self.source
    }

    fn slot(&self, operation: Operation) -> &Slot {
        match operation {
            Operation::Download => &self.download,
            Operation::Upload => &self.upload,
        }
    }
}

impl<S: CredentialSource> AuthProvider for CachedAuthProvider<S> {
    fn get_auth(&self, operation: Operation) -> Result<Credential> {
        let slot = self.slot(operation);
        if let Some(auth) = slot.get() {
            return Ok(auth);
        }

        let _gate = slot.gate.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have fetched while we waited for the gate.
        if let Some(auth) = slot.get() {
            return Ok(auth);
        }

        debug!("fetching {} credentials", operation.as_str());
        let auth = self.source.fetch(operation).map_err(|e| match e {
            Error::AuthFetch(_) => e,
            other => Error::AuthFetch(other.to_string()),
        })?;
        *slot.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(auth.clone());
        Ok(auth)
    }

    fn invalidate_auth(&self, operation: Operation, auth: &Credential) {
        let mut cached = self
            .slot(operation)
            .cached
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if cached.as_ref() == Some(auth) {
            debug!("invalidating {} credentials", operation.as_str());
            *cached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use url::Url;

    fn token(n: usize) -> Credential {
        Credential::new(Url::parse("https://example.com/lfs").unwrap())
            .with_header("Authorization", &format!("Token-{}", n))
    }

    fn counting_provider() -> (Arc<AtomicUsize>, CachedAuthProvider<impl CredentialSource>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let provider = CachedAuthProvider::new(move |_op: Operation| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(Duration::from_millis(20));
            Ok(token(n))
        });
        (fetches, provider)
    }

    #[test]
    fn test_concurrent_first_callers_share_one_fetch() {
        let (fetches, provider) = counting_provider();
        let provider = Arc::new(provider);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    provider.get_auth(Operation::Upload).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), token(1));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operations_are_cached_separately() {
        let (fetches, provider) = counting_provider();
        let download = provider.get_auth(Operation::Download).unwrap();
        let upload = provider.get_auth(Operation::Upload).unwrap();
        assert_ne!(download, upload);
        assert_eq!(provider.get_auth(Operation::Download).unwrap(), download);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_is_compare_and_clear() {
        let (fetches, provider) = counting_provider();
        let first = provider.get_auth(Operation::Download).unwrap();
        provider.invalidate_auth(Operation::Download, &first);

        let second = provider.get_auth(Operation::Download).unwrap();
        assert_eq!(second, token(2));

        // A late invalidation of the stale credential keeps the fresh one.
        provider.invalidate_auth(Operation::Download, &first);
        assert_eq!(provider.get_auth(Operation::Download).unwrap(), second);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fetch_failure_is_auth_error_and_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let provider = CachedAuthProvider::new(move |_op: Operation| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Http("connection refused".into()))
        });

        for _ in 0..2 {
            match provider.get_auth(Operation::Upload) {
                Err(Error::AuthFetch(msg)) => assert!(msg.contains("connection refused")),
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
