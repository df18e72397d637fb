//! In-memory transport for unit tests.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use url::Url;

use crate::http::{Body, HttpRequest, HttpResponse, Method, Transport};
use crate::{AuthProvider, CachedAuthProvider, Credential, Operation, Result};

pub(crate) const LFS_HREF: &str = "https://lfs.test/repo.git/info/lfs";

/// A request as seen by [`MockTransport`], with the body read into memory.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Scripted reply.
pub(crate) struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Reply {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Reply::status(status).body(value.to_string().into_bytes())
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = Box<dyn Fn(&Recorded) -> Reply + Send + Sync>;

/// Transport that records every request and answers from a closure.
pub(crate) struct MockTransport {
    handler: Handler,
    requests: Mutex<Vec<Recorded>>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(MockTransport {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests whose path ends with `suffix`.
    pub fn count(&self, method: Method, suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path().ends_with(suffix))
            .count()
    }
}

impl Transport for MockTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let body = match request.body {
            Body::Empty => Vec::new(),
            Body::Bytes(bytes) => bytes,
            Body::Stream(mut reader) => {
                let mut out = Vec::new();
                reader.read_to_end(&mut out)?;
                out
            }
        };
        let recorded = Recorded {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body,
        };
        self.requests.lock().unwrap().push(recorded.clone());

        let reply = (self.handler)(&recorded);
        Ok(HttpResponse::new(
            reply.status,
            reply.headers,
            Box::new(io::Cursor::new(reply.body)),
        ))
    }
}

pub(crate) fn token(n: usize) -> Credential {
    Credential::new(Url::parse(LFS_HREF).unwrap())
        .with_header("Authorization", &format!("Token-{}", n))
}

/// Provider that hands out `Token-1`, `Token-2`, ... on every fresh fetch.
pub(crate) fn rotating_auth() -> (Arc<AtomicUsize>, Arc<dyn AuthProvider>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let provider = CachedAuthProvider::new(move |_op: Operation| {
        Ok(token(counter.fetch_add(1, Ordering::SeqCst) + 1))
    });
    (fetches, Arc::new(provider))
}

/// Provider that always hands out the same credential.
pub(crate) fn fixed_auth() -> (Arc<AtomicUsize>, Arc<dyn AuthProvider>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let provider = CachedAuthProvider::new(move |_op: Operation| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(token(0))
    });
    (fetches, Arc::new(provider))
}
