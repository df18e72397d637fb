//! LFS wire types.
//!
//! Covers the Batch API and the legacy single-object API.
//! See: https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::Error;

/// Media type of LFS JSON documents.
pub const MIME_LFS_JSON: &str = "application/vnd.git-lfs+json";

/// Media type of object content.
pub const MIME_BINARY: &str = "application/octet-stream";

pub const HEADER_ACCEPT: &str = "Accept";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_LOCATION: &str = "Location";
pub const HEADER_TRANSFER_ENCODING: &str = "Transfer-Encoding";

/// Path of the single-object API, relative to the LFS endpoint.
pub const PATH_OBJECTS: &str = "objects";

/// Path of the Batch API, relative to the LFS endpoint.
pub const PATH_BATCH: &str = "objects/batch";

/// Default maximum number of objects in one batch request.
pub const BATCH_SIZE: usize = 100;

/// Operation type for batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Download objects from the server.
    Download,
    /// Upload objects to the server.
    Upload,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Download => "download",
            Operation::Upload => "upload",
        }
    }
}

/// Identity of an LFS object: content hash and size.
///
/// A size of `-1` means the size is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meta {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: i64,
}

impl Meta {
    pub fn new(oid: impl Into<String>, size: i64) -> Self {
        Meta {
            oid: oid.into(),
            size,
        }
    }
}

/// Kind of action a [`Link`] authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkType {
    Download,
    Upload,
    Verify,
    Self_,
}

impl LinkType {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Download => "download",
            LinkType::Upload => "upload",
            LinkType::Verify => "verify",
            LinkType::Self_ => "self",
        }
    }

    /// Parse a wire action name; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "download" => Some(LinkType::Download),
            "upload" => Some(LinkType::Upload),
            "verify" => Some(LinkType::Verify),
            "self" => Some(LinkType::Self_),
            _ => None,
        }
    }
}

/// An authorized endpoint: URL plus the headers to send with it.
///
/// Used both for per-object actions and as the session credential
/// returned by an [`AuthProvider`](crate::AuthProvider).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// The URL for the action.
    pub href: Url,
    /// HTTP headers to include in the request.
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    /// Absolute expiration time (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl Link {
    pub fn new(href: Url) -> Self {
        Link {
            href,
            header: BTreeMap::new(),
            expires_at: None,
        }
    }

    /// Add a header to this link.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.header.insert(name.to_string(), value.to_string());
        self
    }

    /// Whether both links grant the same access (same target and headers).
    pub fn same_access(&self, other: &Link) -> bool {
        self.href == other.href && self.header == other.header
    }
}

/// Session credential: structurally a [`Link`] scoped to the LFS endpoint.
pub type Credential = Link;

/// Anything carrying a set of object links.
pub trait Links {
    fn links(&self) -> &BTreeMap<LinkType, Link>;

    fn link(&self, kind: LinkType) -> Option<&Link> {
        self.links().get(&kind)
    }
}

/// A batch request to the LFS server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// The operation to perform.
    pub operation: Operation,
    /// The objects to operate on.
    pub objects: Vec<Meta>,
}

impl BatchRequest {
    pub fn new(operation: Operation, objects: Vec<Meta>) -> Self {
        BatchRequest { operation, objects }
    }

    /// Create a new batch request for downloading objects.
    pub fn download(objects: Vec<Meta>) -> Self {
        Self::new(Operation::Download, objects)
    }

    /// Create a new batch request for uploading objects.
    pub fn upload(objects: Vec<Meta>) -> Self {
        Self::new(Operation::Upload, objects)
    }
}

/// A batch response from the LFS server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// The objects with their actions.
    pub objects: Vec<BatchItem>,
}

/// Error information for a batch object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// HTTP status code.
    pub code: u16,
    /// Error message.
    #[serde(default)]
    pub message: String,
}

impl ServerError {
    /// Convert into the error a waiting caller should observe.
    pub fn into_error(self, oid: &str) -> Error {
        if self.code == 404 {
            Error::NotFound(format!("{}: {}", oid, self.message))
        } else {
            Error::Server {
                code: self.code,
                message: self.message,
            }
        }
    }
}

/// An object in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawBatchItem")]
pub struct BatchItem {
    #[serde(flatten)]
    pub meta: Meta,
    /// Actions available for this object.
    #[serde(rename = "actions", serialize_with = "serialize_links")]
    pub links: BTreeMap<LinkType, Link>,
    /// Error information if the object failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

impl BatchItem {
    pub fn with_links(meta: Meta, links: BTreeMap<LinkType, Link>) -> Self {
        BatchItem {
            meta,
            links,
            error: None,
        }
    }

    pub fn with_error(meta: Meta, error: ServerError) -> Self {
        BatchItem {
            meta,
            links: BTreeMap::new(),
            error: Some(error),
        }
    }

    pub fn oid(&self) -> &str {
        &self.meta.oid
    }
}

impl Links for BatchItem {
    fn links(&self) -> &BTreeMap<LinkType, Link> {
        &self.links
    }
}

/// Wire form of a batch item: links may come from `actions` or the
/// legacy `_links` key.
#[derive(Deserialize)]
struct RawBatchItem {
    oid: String,
    size: i64,
    #[serde(default)]
    actions: Option<BTreeMap<String, Link>>,
    #[serde(default, rename = "_links")]
    legacy_links: Option<BTreeMap<String, Link>>,
    #[serde(default)]
    error: Option<ServerError>,
}

impl From<RawBatchItem> for BatchItem {
    fn from(raw: RawBatchItem) -> Self {
        let mut links = parse_links(raw.actions.unwrap_or_default());
        links.extend(parse_links(raw.legacy_links.unwrap_or_default()));
        BatchItem {
            meta: Meta::new(raw.oid, raw.size),
            links,
            error: raw.error,
        }
    }
}

/// Single-object metadata response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawObjectRes")]
pub struct ObjectRes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    pub size: i64,
    #[serde(rename = "_links", serialize_with = "serialize_links")]
    pub links: BTreeMap<LinkType, Link>,
}

impl ObjectRes {
    /// Object identity, when the server reported an oid.
    pub fn meta(&self) -> Option<Meta> {
        self.oid.as_ref().map(|oid| Meta::new(oid.clone(), self.size))
    }
}

impl Links for ObjectRes {
    fn links(&self) -> &BTreeMap<LinkType, Link> {
        &self.links
    }
}

#[derive(Deserialize)]
struct RawObjectRes {
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    size: i64,
    #[serde(rename = "_links", alias = "actions")]
    links: BTreeMap<String, Link>,
}

impl From<RawObjectRes> for ObjectRes {
    fn from(raw: RawObjectRes) -> Self {
        ObjectRes {
            oid: raw.oid,
            size: raw.size,
            links: parse_links(raw.links),
        }
    }
}

fn parse_links(raw: BTreeMap<String, Link>) -> BTreeMap<LinkType, Link> {
    raw.into_iter()
        .filter_map(|(name, link)| LinkType::parse(&name).map(|kind| (kind, link)))
        .collect()
}

fn serialize_links<S>(links: &BTreeMap<LinkType, Link>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;

    let mut map = serializer.serialize_map(Some(links.len()))?;
    for (kind, link) in links {
        map.serialize_entry(kind.as_str(), link)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_request_serialize() {
        let request = BatchRequest::upload(vec![Meta::new("abc123", 1024)]);

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"operation\":\"upload\""));
        assert!(json.contains("\"oid\":\"abc123\""));
        assert!(json.contains("\"size\":1024"));
    }

    #[test]
    fn test_batch_response_deserialize() {
        let json = r#"{
            "transfer": "basic",
            "objects": [
                {
                    "oid": "abc123",
                    "size": 1024,
                    "actions": {
                        "upload": {
                            "href": "https://example.com/upload",
                            "header": {
                                "Authorization": "Bearer token"
                            },
                            "expires_at": "2016-11-10T15:29:07Z"
                        },
                        "verify": {
                            "href": "https://example.com/verify"
                        }
                    }
                }
            ]
        }"#;

        let response: BatchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.objects.len(), 1);
        let item = &response.objects[0];
        assert_eq!(item.oid(), "abc123");
        assert!(item.error.is_none());

        let upload = item.link(LinkType::Upload).unwrap();
        assert_eq!(upload.href.as_str(), "https://example.com/upload");
        assert_eq!(upload.header.get("Authorization").unwrap(), "Bearer token");
        assert_eq!(upload.expires_at.as_deref(), Some("2016-11-10T15:29:07Z"));
        assert!(item.link(LinkType::Verify).unwrap().header.is_empty());
        assert!(item.link(LinkType::Download).is_none());
    }

    #[test]
    fn test_batch_response_with_error() {
        let json = r#"{
            "objects": [
                {
                    "oid": "abc123",
                    "size": 1024,
                    "error": {
                        "code": 404,
                        "message": "Object not found"
                    }
                }
            ]
        }"#;

        let response: BatchResponse = serde_json::from_str(json).unwrap();
        let item = response.objects[0].clone();
        assert!(item.links.is_empty());
        let error = item.error.unwrap();
        assert_eq!(error.code, 404);
        assert!(matches!(error.into_error("abc123"), Error::NotFound(_)));
    }

    #[test]
    fn test_legacy_links_are_merged() {
        let json = r#"{
            "oid": "abc123",
            "size": 3,
            "actions": { "upload": { "href": "https://example.com/up" } },
            "_links": {
                "verify": { "href": "https://example.com/verify" },
                "custom": { "href": "https://example.com/ignored" }
            }
        }"#;

        let item: BatchItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.links.len(), 2);
        assert!(item.link(LinkType::Upload).is_some());
        assert!(item.link(LinkType::Verify).is_some());
    }

    #[test]
    fn test_object_res_deserialize() {
        let json = r#"{
            "oid": "abc123",
            "size": 7,
            "_links": {
                "self": { "href": "https://example.com/objects/abc123" },
                "download": { "href": "https://example.com/data/abc123" }
            }
        }"#;

        let res: ObjectRes = serde_json::from_str(json).unwrap();
        assert_eq!(res.meta(), Some(Meta::new("abc123", 7)));
        assert!(res.link(LinkType::Self_).is_some());
        assert!(res.link(LinkType::Download).is_some());
    }

    #[test]
    fn test_link_same_access_ignores_expiry() {
        let href = Url::parse("https://example.com/lfs").unwrap();
        let a = Link::new(href.clone()).with_header("Authorization", "Token 1");
        let mut b = a.clone();
        b.expires_at = Some("2030-01-01T00:00:00Z".into());
        assert!(a.same_access(&b));
        assert_ne!(a, b);

        let c = Link::new(href).with_header("Authorization", "Token 2");
        assert!(!a.same_access(&c));
    }

    #[test]
    fn test_server_error_conversion() {
        let err = ServerError {
            code: 422,
            message: "bad oid".into(),
        }
        .into_error("abc");
        assert_eq!(err.status(), Some(422));
    }
}
