//! LFS HTTP client: request execution and single-object operations.

use std::io::Read;
use std::sync::Arc;

use log::{debug, warn};
use url::Url;

use crate::auth::{create_auth_provider, join_url, AuthProvider};
use crate::http::{Transport, UreqTransport};
use crate::io::{StreamHandler, StreamProvider};
use crate::protocol::{HEADER_LOCATION, PATH_BATCH, PATH_OBJECTS};
use crate::request::{
    JsonPost, MetaGet, MetaPost, ObjectGet, ObjectOpen, ObjectPut, ObjectVerify, Request,
};
use crate::{
    BatchRequest, BatchResponse, Credential, Error, Link, LinkType, Links, Meta, ObjectRes,
    Operation, Result,
};

/// Credential rotations allowed per unit of work.
pub const MAX_AUTH_COUNT: usize = 1;

/// Retries of a transient server error (500, 502, 503, 504) per request.
pub const MAX_RETRY_COUNT: usize = 2;

/// Redirects followed per request.
pub const MAX_REDIRECT_COUNT: usize = 5;

/// What happens to the response body after a successful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Drain and release the body.
    Close,
    /// The request took the body and the caller owns it.
    KeepOpen,
}

/// LFS client for communicating with an LFS server.
///
/// This type is cheaply cloneable - multiple clones share the same auth
/// provider and HTTP transport.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn Transport>,
}

impl Client {
    /// Create a client using the default `ureq` transport.
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self::with_transport(auth, Arc::new(UreqTransport::new()))
    }

    pub fn with_transport(auth: Arc<dyn AuthProvider>, transport: Arc<dyn Transport>) -> Self {
        Client {
            inner: Arc::new(ClientInner { auth, transport }),
        }
    }

    /// Create a client for a Git remote URL (`https://...`, `ssh://...` or
    /// `user@host:path`).
    pub fn from_git_url(git_url: &str) -> Result<Self> {
        Ok(Self::new(create_auth_provider(git_url)?))
    }

    pub fn auth_provider(&self) -> &Arc<dyn AuthProvider> {
        &self.inner.auth
    }

    /// Compute the oid and size of a stream.
    pub fn generate_meta(provider: &dyn StreamProvider) -> Result<Meta> {
        crate::io::generate_meta(provider)
    }

    /// Get metadata for an object. `None` if the server doesn't have it.
    pub fn get_meta(&self, oid: &str) -> Result<Option<ObjectRes>> {
        self.do_work(Operation::Download, |auth| self.fetch_meta(oid, auth))
    }

    /// Announce an upload. `None` if the server already has the object.
    pub fn post_meta(&self, meta: &Meta) -> Result<Option<ObjectRes>> {
        self.do_work(Operation::Upload, |auth| self.announce(meta, auth))
    }

    /// Send a batch request.
    pub fn post_batch(&self, request: &BatchRequest) -> Result<BatchResponse> {
        self.do_work(request.operation, |auth| self.send_batch(request, auth))
    }

    /// Send a batch request with an explicit credential, without rotation.
    pub fn send_batch(&self, request: &BatchRequest, auth: &Credential) -> Result<BatchResponse> {
        self.do_request(
            Some(auth),
            &JsonPost::<_, BatchResponse>::new(request),
            join_url(&auth.href, &[PATH_BATCH])?,
            ClosePolicy::Close,
        )
    }

    /// Upload an object through the single-object API.
    ///
    /// Returns `false` if the server already had the object.
    pub fn put_object(&self, provider: &dyn StreamProvider, meta: &Meta) -> Result<bool> {
        self.do_work(Operation::Upload, |auth| match self.announce(meta, auth)? {
            Some(links) => self.put_object_links(provider, meta, &links),
            None => Ok(false),
        })
    }

    /// Upload an object to its upload link, then verify it if asked to.
    ///
    /// Returns `false` when there is no upload link.
    pub fn put_object_links(
        &self,
        provider: &dyn StreamProvider,
        meta: &Meta,
        links: &impl Links,
    ) -> Result<bool> {
        let upload = match links.link(LinkType::Upload) {
            Some(link) => link,
            None => return Ok(false),
        };
        self.do_request(
            Some(upload),
            &ObjectPut {
                provider,
                size: meta.size,
            },
            upload.href.clone(),
            ClosePolicy::Close,
        )?;

        if let Some(verify) = links.link(LinkType::Verify) {
            self.do_request(
                Some(verify),
                &ObjectVerify { meta: meta.clone() },
                verify.href.clone(),
                ClosePolicy::Close,
            )?;
        }
        Ok(true)
    }

    /// Download an object by oid and pass its validated content to `handler`.
    pub fn get_object<T>(&self, oid: &str, handler: &dyn StreamHandler<T>) -> Result<T> {
        self.do_work(Operation::Download, |auth| {
            let res = self.object_links(oid, auth)?;
            let meta = res.meta().unwrap_or_else(|| Meta::new(oid, -1));
            self.get_object_links(Some(&meta), &res, handler)
        })
    }

    /// Download an object from its download link.
    ///
    /// Content is validated against `meta` when given.
    pub fn get_object_links<T>(
        &self,
        meta: Option<&Meta>,
        links: &impl Links,
        handler: &dyn StreamHandler<T>,
    ) -> Result<T> {
        let link = download_link(meta, links)?;
        self.do_request(
            Some(link),
            &ObjectGet {
                meta: meta.cloned(),
                handler,
            },
            link.href.clone(),
            ClosePolicy::Close,
        )
    }

    /// Open an object stream by oid. The stream fails on integrity errors.
    pub fn open_object(&self, oid: &str) -> Result<Box<dyn Read + Send>> {
        self.do_work(Operation::Download, |auth| {
            let res = self.object_links(oid, auth)?;
            let meta = res.meta().unwrap_or_else(|| Meta::new(oid, -1));
            self.open_object_links(Some(&meta), &res)
        })
    }

    pub fn open_object_links(
        &self,
        meta: Option<&Meta>,
        links: &impl Links,
    ) -> Result<Box<dyn Read + Send>> {
        let link = download_link(meta, links)?;
        self.do_request(
            Some(link),
            &ObjectOpen {
                meta: meta.cloned(),
            },
            link.href.clone(),
            ClosePolicy::KeepOpen,
        )
    }

    fn fetch_meta(&self, oid: &str, auth: &Credential) -> Result<Option<ObjectRes>> {
        let url = join_url(&auth.href, &[&format!("{}/", PATH_OBJECTS), oid])?;
        self.do_request(Some(auth), &MetaGet, url, ClosePolicy::Close)
    }

    fn object_links(&self, oid: &str, auth: &Credential) -> Result<ObjectRes> {
        self.fetch_meta(oid, auth)?
            .ok_or_else(|| Error::NotFound(oid.to_string()))
    }

    fn announce(&self, meta: &Meta, auth: &Credential) -> Result<Option<ObjectRes>> {
        self.do_request(
            Some(auth),
            &MetaPost { meta: meta.clone() },
            join_url(&auth.href, &[PATH_OBJECTS])?,
            ClosePolicy::Close,
        )
    }

    /// Run `work` with a credential, rotating it once on 401.
    ///
    /// A rotation that yields a credential with the same access as the
    /// rejected one ends with the original 401. 403 is never rotated.
    pub fn do_work<T, F>(&self, operation: Operation, mut work: F) -> Result<T>
    where
        F: FnMut(&Credential) -> Result<T>,
    {
        let provider = &self.inner.auth;
        let mut auth = provider.get_auth(operation)?;
        let mut rotations = 0;
        loop {
            match work(&auth) {
                Err(err @ Error::Unauthorized { .. }) => {
                    if rotations >= MAX_AUTH_COUNT {
                        return Err(err);
                    }
                    rotations += 1;
                    provider.invalidate_auth(operation, &auth);
                    let fresh = provider.get_auth(operation)?;
                    if fresh.same_access(&auth) {
                        debug!("{} credentials unchanged after invalidation", operation.as_str());
                        return Err(err);
                    }
                    auth = fresh;
                }
                other => return other,
            }
        }
    }

    /// Execute one request, following redirects and retrying transient
    /// server errors.
    ///
    /// `link` headers are sent with every attempt, including redirects.
    pub fn do_request<R: Request>(
        &self,
        link: Option<&Link>,
        request: &R,
        url: Url,
        policy: ClosePolicy,
    ) -> Result<R::Output> {
        let mut url = url;
        let mut redirects = 0;
        let mut retries = 0;
        loop {
            let mut http = request.create(&url)?;
            if let Some(link) = link {
                http.apply_link_headers(&link.header);
            }
            debug!("{} {}", http.method, url);

            let mut response = self.inner.transport.execute(http)?;
            let status = response.status;

            if request.success_codes().contains(&status) {
                let result = request.process(&mut response);
                if policy == ClosePolicy::Close || result.is_err() {
                    response.discard();
                }
                return result;
            }

            let location = response.header(HEADER_LOCATION).map(str::to_string);
            response.discard();

            match status {
                401 => return Err(Error::Unauthorized { url: url.to_string() }),
                403 => return Err(Error::Forbidden { url: url.to_string() }),
                301 | 302 | 303 | 307 => match location {
                    Some(location) if redirects < MAX_REDIRECT_COUNT => {
                        redirects += 1;
                        let next = url.join(&location)?;
                        debug!("{} redirected to {}", url, next);
                        url = next;
                    }
                    _ => {
                        return Err(Error::UnexpectedStatus {
                            url: url.to_string(),
                            status,
                        })
                    }
                },
                500 | 502 | 503 | 504 => {
                    if retries >= MAX_RETRY_COUNT {
                        return Err(Error::UnexpectedStatus {
                            url: url.to_string(),
                            status,
                        });
                    }
                    retries += 1;
                    warn!("{} - {}, retrying ({}/{})", url, status, retries, MAX_RETRY_COUNT);
                }
                _ => {
                    return Err(Error::UnexpectedStatus {
                        url: url.to_string(),
                        status,
                    })
                }
            }
        }
    }
}

fn download_link<'a>(meta: Option<&Meta>, links: &'a impl Links) -> Result<&'a Link> {
    links.link(LinkType::Download).ok_or_else(|| {
        Error::NotFound(meta.map_or_else(|| "object".to_string(), |m| m.oid.clone()))
    })
}
