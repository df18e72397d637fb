//! Typed LFS requests.
//!
//! A [`Request`] knows how to build one HTTP request for a given URL and how
//! to turn a successful response into a value. Everything else (auth
//! headers, redirects, retries) is handled by
//! [`Client::do_request`](crate::Client::do_request).

use std::io::{self, Read};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::http::{Body, HttpRequest, HttpResponse, Method};
use crate::io::{StreamHandler, StreamProvider, ValidatingReader};
use crate::protocol::{
    HEADER_ACCEPT, HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, MIME_BINARY, MIME_LFS_JSON,
};
use crate::{Meta, ObjectRes, Result};

/// One kind of HTTP exchange with the LFS server.
pub trait Request {
    type Output;

    /// Build the HTTP request. Called again for every redirect and retry.
    fn create(&self, url: &Url) -> Result<HttpRequest>;

    /// Turn a response with one of [`success_codes`](Request::success_codes)
    /// into the result.
    fn process(&self, response: &mut HttpResponse) -> Result<Self::Output>;

    fn success_codes(&self) -> &[u16] {
        &[200]
    }
}

fn json_request<T: Serialize>(method: Method, url: &Url, body: &T) -> Result<HttpRequest> {
    Ok(HttpRequest::new(method, url.clone())
        .header(HEADER_ACCEPT, MIME_LFS_JSON)
        .header(HEADER_CONTENT_TYPE, MIME_LFS_JSON)
        .body(Body::Bytes(serde_json::to_vec(body)?)))
}

fn json_response<T: DeserializeOwned>(response: &mut HttpResponse) -> Result<T> {
    let body = response.read_body()?;
    Ok(serde_json::from_slice(&body)?)
}

/// POST a JSON document and parse a JSON reply.
pub struct JsonPost<Req, Res> {
    body: Req,
    _response: PhantomData<fn() -> Res>,
}

impl<Req, Res> JsonPost<Req, Res> {
    pub fn new(body: Req) -> Self {
        JsonPost {
            body,
            _response: PhantomData,
        }
    }
}

impl<Req: Serialize, Res: DeserializeOwned> Request for JsonPost<Req, Res> {
    type Output = Res;

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        json_request(Method::Post, url, &self.body)
    }

    fn process(&self, response: &mut HttpResponse) -> Result<Res> {
        json_response(response)
    }
}

/// GET object metadata. `None` when the server does not have the object.
pub struct MetaGet;

impl Request for MetaGet {
    type Output = Option<ObjectRes>;

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        Ok(HttpRequest::new(Method::Get, url.clone()).header(HEADER_ACCEPT, MIME_LFS_JSON))
    }

    fn process(&self, response: &mut HttpResponse) -> Result<Option<ObjectRes>> {
        if response.status == 404 {
            return Ok(None);
        }
        json_response(response).map(Some)
    }

    fn success_codes(&self) -> &[u16] {
        &[200, 404]
    }
}

/// POST object metadata before an upload.
///
/// `200` means the server already has the object (`None`); `202` returns
/// the links to upload it.
pub struct MetaPost {
    pub meta: Meta,
}

impl Request for MetaPost {
    type Output = Option<ObjectRes>;

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        json_request(Method::Post, url, &self.meta)
    }

    fn process(&self, response: &mut HttpResponse) -> Result<Option<ObjectRes>> {
        if response.status == 200 {
            return Ok(None);
        }
        json_response(response).map(Some)
    }

    fn success_codes(&self) -> &[u16] {
        &[200, 202]
    }
}

/// PUT object content.
pub struct ObjectPut<'a> {
    pub provider: &'a dyn StreamProvider,
    /// Declared size; negative when unknown.
    pub size: i64,
}

impl Request for ObjectPut<'_> {
    type Output = ();

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        let mut request = HttpRequest::new(Method::Put, url.clone())
            .header(HEADER_CONTENT_TYPE, MIME_BINARY)
            .body(Body::Stream(self.provider.open()?));
        if self.size >= 0 {
            request.set_header(HEADER_CONTENT_LENGTH, &self.size.to_string());
        }
        Ok(request)
    }

    fn process(&self, _response: &mut HttpResponse) -> Result<()> {
        Ok(())
    }

    fn success_codes(&self) -> &[u16] {
        &[200, 201]
    }
}

/// POST `{oid, size}` to a verify link after an upload.
pub struct ObjectVerify {
    pub meta: Meta,
}

impl Request for ObjectVerify {
    type Output = ();

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        json_request(Method::Post, url, &self.meta)
    }

    fn process(&self, _response: &mut HttpResponse) -> Result<()> {
        Ok(())
    }
}

fn object_get(url: &Url) -> HttpRequest {
    HttpRequest::new(Method::Get, url.clone()).header(HEADER_ACCEPT, MIME_BINARY)
}

/// GET object content and feed it to a handler.
///
/// With a known `meta` the handler sees a validated stream, and whatever the
/// handler leaves unread is drained through the validator afterwards.
pub struct ObjectGet<'a, T> {
    pub meta: Option<Meta>,
    pub handler: &'a dyn StreamHandler<T>,
}

impl<T> Request for ObjectGet<'_, T> {
    type Output = T;

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        Ok(object_get(url))
    }

    fn process(&self, response: &mut HttpResponse) -> Result<T> {
        let body = response.take_body();
        match &self.meta {
            Some(meta) => {
                let mut reader = ValidatingReader::new(body, meta.clone());
                let result = self.handler.handle(&mut reader)?;
                io::copy(&mut reader, &mut io::sink())?;
                Ok(result)
            }
            None => {
                let mut body = body;
                self.handler.handle(&mut body)
            }
        }
    }
}

/// GET object content and hand the open stream to the caller.
///
/// Must be executed with [`ClosePolicy::KeepOpen`](crate::ClosePolicy).
pub struct ObjectOpen {
    pub meta: Option<Meta>,
}

impl Request for ObjectOpen {
    type Output = Box<dyn Read + Send>;

    fn create(&self, url: &Url) -> Result<HttpRequest> {
        Ok(object_get(url))
    }

    fn process(&self, response: &mut HttpResponse) -> Result<Box<dyn Read + Send>> {
        let body = response.take_body();
        Ok(match &self.meta {
            Some(meta) => Box::new(ValidatingReader::new(body, meta.clone())),
            None => body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ByteStreamProvider;
    use crate::{BatchRequest, BatchResponse, Error};

    fn url() -> Url {
        Url::parse("https://example.com/lfs/objects").unwrap()
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::new(status, Vec::new(), Box::new(io::Cursor::new(body.as_bytes().to_vec())))
    }

    fn body_bytes(request: HttpRequest) -> Vec<u8> {
        match request.body {
            Body::Bytes(bytes) => bytes,
            Body::Stream(mut reader) => {
                let mut out = Vec::new();
                reader.read_to_end(&mut out).unwrap();
                out
            }
            Body::Empty => Vec::new(),
        }
    }

    #[test]
    fn test_json_post() {
        let post: JsonPost<_, BatchResponse> =
            JsonPost::new(BatchRequest::download(vec![Meta::new("abc", 3)]));
        let request = post.create(&url()).unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.header_value("Content-Type"), Some(MIME_LFS_JSON));
        assert_eq!(request.header_value("Accept"), Some(MIME_LFS_JSON));
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(request)).unwrap();
        assert_eq!(json["operation"], "download");

        let res = post
            .process(&mut response(200, r#"{"objects":[{"oid":"abc","size":3}]}"#))
            .unwrap();
        assert_eq!(res.objects[0].oid(), "abc");
    }

    #[test]
    fn test_meta_get_not_found() {
        assert!(MetaGet.success_codes().contains(&404));
        assert!(MetaGet.process(&mut response(404, "")).unwrap().is_none());
        let res = MetaGet
            .process(&mut response(200, r#"{"oid":"abc","size":3,"_links":{}}"#))
            .unwrap();
        assert!(res.is_some());
    }

    #[test]
    fn test_meta_post_already_stored() {
        let post = MetaPost {
            meta: Meta::new("abc", 3),
        };
        assert!(post.process(&mut response(200, "")).unwrap().is_none());
        let res = post
            .process(&mut response(
                202,
                r#"{"oid":"abc","size":3,"_links":{"upload":{"href":"https://example.com/up"}}}"#,
            ))
            .unwrap()
            .unwrap();
        assert!(res.links.contains_key(&crate::LinkType::Upload));
    }

    #[test]
    fn test_object_put_reopens_stream() {
        let provider = ByteStreamProvider::from("hello");
        let put = ObjectPut {
            provider: &provider,
            size: 5,
        };
        for _ in 0..2 {
            let request = put.create(&url()).unwrap();
            assert_eq!(request.header_value("Content-Length"), Some("5"));
            assert_eq!(request.header_value("Content-Type"), Some(MIME_BINARY));
            assert_eq!(body_bytes(request), b"hello");
        }

        let unsized_put = ObjectPut {
            provider: &provider,
            size: -1,
        };
        assert!(unsized_put.create(&url()).unwrap().header_value("Content-Length").is_none());
    }

    #[test]
    fn test_object_get_drains_through_validator() {
        // sha256("hello")
        let meta = Meta::new(
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            5,
        );
        let peek = |stream: &mut dyn Read| -> Result<u8> {
            let mut first = [0u8; 1];
            stream.read_exact(&mut first)?;
            Ok(first[0])
        };
        let get = ObjectGet {
            meta: Some(meta.clone()),
            handler: &peek,
        };
        assert_eq!(get.process(&mut response(200, "hello")).unwrap(), b'h');

        // Handler reads one byte only, the corrupted tail is still caught.
        let err = get.process(&mut response(200, "hellO")).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "{:?}", err);
    }

    #[test]
    fn test_object_open_validates() {
        let open = ObjectOpen {
            meta: Some(Meta::new("0000", 5)),
        };
        let mut stream = open.process(&mut response(200, "hello")).unwrap();
        let mut out = Vec::new();
        assert!(stream.read_to_end(&mut out).is_err());
    }
}
