//! Request, response and multipart types

use bytes::Bytes;
use futures::stream::BoxStream;
use hyper::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::bce::observer::TransferObserver;
use crate::bce::signer::normalize;

/// Header map. Keys are stored lower-case by the transport.
pub type Headers = BTreeMap<String, String>;

/// Query parameters. An absent value is represented by the empty string.
pub type Params = BTreeMap<String, String>;

/// A boxed stream of body chunks.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Access credentials, immutable for the lifetime of a client
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    /// Present when temporary (STS) credentials are used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Both keys are present
    pub fn is_valid(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Request body
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Chunked source; `length` is the total byte count when known upfront
    Stream { stream: ByteStream, length: Option<u64> },
}

impl Body {
    pub fn stream(stream: ByteStream, length: Option<u64>) -> Self {
        Body::Stream { stream, length }
    }

    /// Content length derivable from the body itself
    pub fn content_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length={:?})", length),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

/// Write destination for streamed response bodies
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// A logical request before signing
pub struct BceRequest {
    pub method: Method,
    /// Absolute, normalized resource path
    pub resource: String,
    pub params: Params,
    pub headers: Headers,
    pub body: Body,
    /// When set, a 2xx response body is piped here instead of buffered
    pub output: Option<OutputSink>,
    pub observer: Option<Arc<dyn TransferObserver>>,
    pub cancel: CancellationToken,
}

impl BceRequest {
    /// Build a request for `resource`; the path is normalized on the way in.
    pub fn new(method: Method, resource: &str) -> Self {
        Self {
            method,
            resource: normalize_path(resource),
            params: Params::new(),
            headers: Headers::new(),
            body: Body::Empty,
            output: None,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        for (k, v) in headers {
            self.headers.insert(k.to_ascii_lowercase(), v);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn output(mut self, sink: OutputSink) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn observer(mut self, observer: Option<Arc<dyn TransferObserver>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for BceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BceRequest")
            .field("method", &self.method)
            .field("resource", &self.resource)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("has_output", &self.output.is_some())
            .finish()
    }
}

/// Resource path of an object: `/v1/<bucket>/<key>`
pub fn resource_path(bucket: &str, key: &str) -> String {
    let mut raw = String::with_capacity(4 + bucket.len() + key.len() + 2);
    raw.push_str("/v1");
    if !bucket.is_empty() {
        raw.push('/');
        raw.push_str(&normalize(bucket, true));
    }
    if !key.is_empty() {
        raw.push('/');
        raw.push_str(&normalize(key, false));
    }
    normalize_path(&raw)
}

/// Resolve `.`, `..` and repeated separators; backslashes become `/`.
///
/// The result always has exactly one leading `/` and never climbs above root.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trailing = unified.len() > 1 && unified.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(unified.len() + 1);
    for seg in &segments {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() || (trailing && !segments.is_empty()) {
        out.push('/');
    }
    out
}

/// Parsed response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(serde_json::Value),
    Raw(Bytes),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Deserialize a JSON body into `T`
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::bce::client::Result<T> {
        match self {
            ResponseBody::Json(v) => Ok(T::deserialize(v)?),
            other => Err(crate::bce::client::BceError::InvalidResponse(format!(
                "Expected a JSON body, got {:?}",
                other
            ))),
        }
    }
}

/// Successful exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Response headers, keys lower-cased
    pub http_headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.http_headers.get(name).map(String::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header(crate::bce::headers::ETAG)
    }
}

// =============================================================================
// Multipart Upload Types
// =============================================================================

/// Response of InitiateMultipartUpload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateMultipartUploadResponse {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    pub upload_id: String,
}

/// Part entry of CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u32,
    pub e_tag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, e_tag: impl Into<String>) -> Self {
        Self {
            part_number,
            e_tag: e_tag.into(),
        }
    }
}

/// Body of CompleteMultipartUpload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteMultipartUploadRequest {
    pub parts: Vec<CompletedPart>,
}

/// Response of CompleteMultipartUpload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartUploadResponse {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub e_tag: String,
}

/// One entry of ListParts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartSummary {
    pub part_number: u32,
    #[serde(default)]
    pub e_tag: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
}

/// Response of ListParts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPartsResponse {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub next_part_number_marker: Option<u32>,
    #[serde(default)]
    pub parts: Vec<PartSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/v1/bucket/key"), "/v1/bucket/key");
        assert_eq!(normalize_path("v1//bucket/./key"), "/v1/bucket/key");
        assert_eq!(normalize_path("/v1/bucket/a/../b"), "/v1/bucket/b");
        assert_eq!(normalize_path("\\v1\\bucket\\key"), "/v1/bucket/key");
        assert_eq!(normalize_path("/../../etc"), "/etc");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/v1/bucket/dir/"), "/v1/bucket/dir/");
    }

    #[test]
    fn test_resource_path() {
        assert_eq!(resource_path("bucket", "dir/file.txt"), "/v1/bucket/dir/file.txt");
        assert_eq!(resource_path("bucket", "a b.txt"), "/v1/bucket/a%20b.txt");
        assert_eq!(resource_path("bucket", ""), "/v1/bucket");
        assert_eq!(resource_path("", ""), "/v1");
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("ak", "super-secret").with_session_token("tok");
        let out = format!("{:?}", creds);
        assert!(out.contains("ak"));
        assert!(!out.contains("super-secret"));
        assert!(!out.contains("tok\""));
    }

    #[test]
    fn test_completed_part_wire_format() {
        let body = CompleteMultipartUploadRequest {
            parts: vec![CompletedPart::new(1, "abc")],
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"parts":[{"partNumber":1,"eTag":"abc"}]}"#);
    }

    #[test]
    fn test_body_content_length() {
        assert_eq!(Body::Empty.content_length(), Some(0));
        assert_eq!(Body::from(vec![1u8, 2, 3]).content_length(), Some(3));
        let stream: ByteStream = Box::pin(futures::stream::empty::<std::io::Result<Bytes>>());
        assert_eq!(Body::stream(stream, None).content_length(), None);
    }
}
