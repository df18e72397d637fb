//! HTTP transport abstraction.
//!
//! The executor only needs "send this request, give me status, headers and
//! body". [`UreqTransport`] implements that on top of a `ureq` agent; tests
//! substitute their own [`Transport`].

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};

use url::Url;

use crate::protocol::{HEADER_CONTENT_LENGTH, HEADER_TRANSFER_ENCODING};
use crate::{Error, Result};

/// HTTP method used by LFS requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A prepared HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        HttpRequest {
            method,
            url,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Set a header, replacing any previous value with the same name.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Apply the headers of an authorized link.
    ///
    /// A link asking for `Transfer-Encoding: chunked` is honored by dropping
    /// the explicit content length; the header itself is never forwarded.
    pub fn apply_link_headers(&mut self, headers: &BTreeMap<String, String>) {
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(HEADER_TRANSFER_ENCODING) {
                if value.eq_ignore_ascii_case("chunked") {
                    self.remove_header(HEADER_CONTENT_LENGTH);
                }
            } else {
                self.set_header(name, value);
            }
        }
    }
}

/// A received HTTP response.
///
/// The body is optional so that a request can take ownership of it
/// (streaming downloads) while the executor keeps the status and headers.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: Option<Box<dyn Read + Send>>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Box<dyn Read + Send>) -> Self {
        HttpResponse {
            status,
            headers,
            body: Some(body),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Take ownership of the body. Subsequent calls return an empty reader.
    pub fn take_body(&mut self) -> Box<dyn Read + Send> {
        self.body
            .take()
            .unwrap_or_else(|| Box::new(io::empty()))
    }

    /// Read the whole body into memory.
    pub fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.take_body().read_to_end(&mut content)?;
        Ok(content)
    }

    /// Consume and release whatever is left of the body.
    pub fn discard(&mut self) {
        if let Some(mut body) = self.body.take() {
            if let Err(e) = io::copy(&mut body, &mut io::sink()) {
                log::debug!("failed to drain response body: {}", e);
            }
        }
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Executes prepared HTTP requests.
pub trait Transport: Send + Sync {
    /// Send the request and return the response whatever its status code.
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by a `ureq` agent.
///
/// Redirects are disabled on the agent: the executor follows them itself
/// so that method and body are preserved.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        UreqTransport {
            agent: ureq::AgentBuilder::new()
                .redirects(0)
                .user_agent(concat!("gitlfs-client/", env!("CARGO_PKG_VERSION")))
                .build(),
        }
    }

    /// Use a preconfigured agent (timeouts, proxy, TLS).
    ///
    /// The agent should be built with `redirects(0)`.
    pub fn with_agent(agent: ureq::Agent) -> Self {
        UreqTransport { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut req = self.agent.request_url(method.as_str(), &url);
        for (key, value) in &headers {
            req = req.set(key, value);
        }

        let result = match body {
            Body::Empty => req.call(),
            Body::Bytes(bytes) => req.send_bytes(&bytes),
            Body::Stream(reader) => req.send(reader),
        };

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(Error::Http(format!("{} {}: {}", method, url, transport)))
            }
        };

        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_string();
                Some((name, value))
            })
            .collect();

        Ok(HttpResponse::new(status, headers, Box::new(response.into_reader())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_headers_override_request_headers() {
        let url = Url::parse("https://example.com/object").unwrap();
        let mut request = HttpRequest::new(Method::Put, url)
            .header("Content-Length", "42")
            .header("authorization", "old");

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "new".to_string());
        request.apply_link_headers(&headers);

        assert_eq!(request.header_value("AUTHORIZATION"), Some("new"));
        assert_eq!(request.header_value("content-length"), Some("42"));
        assert_eq!(request.headers.len(), 2);
    }

    #[test]
    fn test_chunked_link_drops_content_length() {
        let url = Url::parse("https://example.com/object").unwrap();
        let mut request = HttpRequest::new(Method::Put, url).header("Content-Length", "42");

        let mut headers = BTreeMap::new();
        headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        request.apply_link_headers(&headers);

        assert!(request.header_value("Content-Length").is_none());
        assert!(request.header_value("Transfer-Encoding").is_none());
    }

    #[test]
    fn test_response_body_handling() {
        let mut response = HttpResponse::new(
            200,
            vec![("Location".to_string(), "/next".to_string())],
            Box::new(io::Cursor::new(b"payload".to_vec())),
        );
        assert_eq!(response.header("location"), Some("/next"));
        assert_eq!(response.read_body().unwrap(), b"payload");
        // Body already taken
        assert!(response.read_body().unwrap().is_empty());
        response.discard();
    }
}
