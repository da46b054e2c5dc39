//! HTTP transport for signed BCE requests
//!
//! Built on hyper's pooled legacy client:
//! - HTTP/1.1 with a tuned idle pool (clones share it)
//! - TCP_NODELAY and TCP keepalive
//! - native-tls (OpenSSL) for TLS
//! - Streaming request bodies (files, chunk streams) without buffering
//! - Streaming 2xx response bodies into a caller-supplied sink
//! - One normalized success/failure envelope per exchange

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::bce::headers::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DEFAULT_CONTENT_TYPE, ETAG, HOST,
    USER_AGENT, X_BCE_DATE, X_BCE_REQUEST_ID,
};
use crate::bce::observer::{TransferObserver, TransferProgress};
use crate::bce::signer::{format_timestamp, Signable};
use crate::bce::types::{Body, BceRequest, Credentials, Headers, OutputSink, Params, Response, ResponseBody};

/// Message used for informational (1xx) responses
const INFORMATIONAL_STATUS_MESSAGE: &str = "Can not handle 1xx http status code.";

/// BCE client errors
#[derive(Error, Debug)]
pub enum BceError {
    /// Malformed arguments, caught before any network call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing credentials or unusable signing input
    #[error("Signing error: {0}")]
    Signing(String),

    /// Non-2xx (or 1xx) response
    #[error("BCE error: {status_code} - {message}")]
    Service {
        status_code: u16,
        message: String,
        code: Option<String>,
        request_id: Option<String>,
    },

    /// Declared part size does not match the data
    #[error("Part {part_number}: declared {expected} bytes but measured {actual}")]
    Integrity {
        part_number: u32,
        expected: u64,
        actual: u64,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<hyper_util::client::legacy::Error> for BceError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        BceError::Client(err.to_string())
    }
}

impl BceError {
    /// Build a service failure
    pub fn service(status_code: u16, message: impl Into<String>) -> Self {
        BceError::Service {
            status_code,
            message: message.into(),
            code: None,
            request_id: None,
        }
    }

    /// HTTP status of a service failure
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BceError::Service { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Service error code, e.g. `NoSuchKey`
    pub fn code(&self) -> Option<&str> {
        match self {
            BceError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            BceError::Service { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Whether repeating the same request could succeed.
    ///
    /// Validation, signing, integrity and cancellation failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            BceError::Service { status_code, .. } => {
                *status_code == 429 || (500..600).contains(status_code)
            }
            BceError::Hyper(_)
            | BceError::Client(_)
            | BceError::Io(_)
            | BceError::Timeout(_)
            | BceError::InvalidResponse(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BceError>;

/// Anything that can carry a [`BceRequest`] to the service.
///
/// The resource layer and the upload orchestrator only talk to this trait,
/// which keeps them testable against scripted transports.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: BceRequest) -> Result<Response>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: BceRequest) -> Result<Response> {
        (**self).send(request).await
    }
}

/// Request body type handed to hyper
pub type RequestBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Pooled HTTP client bound to one endpoint and one set of credentials
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct HttpClient {
    client: HyperClient<HttpsConnector<HttpConnector>, RequestBody>,
    /// Endpoint without trailing slash, e.g. `https://bj.bcebos.com`
    endpoint: String,
    /// Authority of the endpoint, used as the signed `host` header
    host: String,
    credentials: Credentials,
    timeout: Duration,
    user_agent: String,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpClient {
    /// Create a client for `endpoint` (`http://` or `https://` URL)
    pub fn new(endpoint: &str, credentials: Credentials, connect_timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| BceError::InvalidArgument(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        if uri.scheme().is_none() {
            return Err(BceError::InvalidArgument(format!(
                "Endpoint {} must include http:// or https://",
                endpoint
            )));
        }
        let host = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| BceError::InvalidArgument(format!("Endpoint {} has no host", endpoint)))?;

        let insecure_tls = std::env::var("BCE_INSECURE_TLS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(connect_timeout));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?
        } else {
            TlsConnector::new()?
        };

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            endpoint,
            host,
            credentials,
            timeout: Duration::from_secs(300),
            user_agent: format!(
                "bce-sdk-rust/{}/{}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS
            ),
        })
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Full URL: endpoint + resource + encoded query
    pub fn request_url(&self, resource: &str, params: &Params) -> String {
        let qs = encode_query(params);
        let mut url = String::with_capacity(self.endpoint.len() + resource.len() + qs.len() + 1);
        url.push_str(&self.endpoint);
        url.push_str(resource);
        if !qs.is_empty() {
            url.push('?');
            url.push_str(&qs);
        }
        url
    }

    fn default_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(X_BCE_DATE.to_string(), format_timestamp(&Utc::now()));
        headers.insert(CONNECTION.to_string(), "keep-alive".to_string());
        headers.insert(CONTENT_TYPE.to_string(), DEFAULT_CONTENT_TYPE.to_string());
        headers.insert(HOST.to_string(), self.host.clone());
        headers.insert(USER_AGENT.to_string(), self.user_agent.clone());
        headers
    }

    /// Merge defaults under caller headers and fill in `content-length`.
    ///
    /// A zero length is left out for GET/HEAD: servers drop it on those
    /// methods and the signature would no longer match.
    pub fn prepare_headers(&self, method: &Method, caller: Headers, body: &Body) -> Result<Headers> {
        let mut headers = self.default_headers();
        for (k, v) in caller {
            headers.insert(k.to_ascii_lowercase(), v);
        }

        if !headers.contains_key(CONTENT_LENGTH) {
            let length = body.content_length().ok_or_else(|| {
                BceError::InvalidArgument("No Content-Length is specified.".to_string())
            })?;
            let bodiless = *method == Method::GET || *method == Method::HEAD;
            if !(length == 0 && bodiless) {
                headers.insert(CONTENT_LENGTH.to_string(), length.to_string());
            }
        }

        Ok(headers)
    }

    /// Sign and send one request.
    ///
    /// `signer` is called with this client's credentials and the fully merged
    /// headers; its result becomes the `Authorization` header.
    pub async fn execute(&self, request: BceRequest, signer: &dyn Signable) -> Result<Response> {
        let BceRequest {
            method,
            resource,
            params,
            headers,
            body,
            output,
            observer,
            cancel,
        } = request;

        let mut headers = self.prepare_headers(&method, headers, &body)?;
        let authorization = signer.sign(&self.credentials, &method, &resource, &params, &headers)?;
        headers.insert(AUTHORIZATION.to_string(), authorization);

        let url = self.request_url(&resource, &params);
        tracing::debug!(method = %method, url = %url, "bce_request");

        let total = headers.get(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        let request_body = Self::request_body(body, observer.clone(), cancel.clone(), total);

        let mut req = Request::builder().method(method.clone()).uri(&url);
        for (key, value) in headers.iter() {
            req = req.header(key, value);
        }
        let req = req.body(request_body)?;

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(BceError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.exchange(req, output)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(BceError::Timeout(self.timeout)),
            },
        };

        match &result {
            Ok(_) => {
                tracing::debug!(
                    method = %method,
                    url = %url,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "bce_response"
                );
            }
            Err(BceError::Cancelled) => {
                tracing::debug!(method = %method, url = %url, "bce_request_cancelled");
                if let Some(observer) = &observer {
                    observer.on_abort();
                }
            }
            Err(e) => {
                tracing::debug!(method = %method, url = %url, error = %e, "bce_request_failed");
                if let Some(observer) = &observer {
                    observer.on_error(e);
                }
            }
        }

        result
    }

    /// Turn a [`Body`] into a hyper body. Streams report progress per chunk
    /// and stop yielding once `cancel` fires.
    fn request_body(
        body: Body,
        observer: Option<Arc<dyn TransferObserver>>,
        cancel: CancellationToken,
        total: Option<u64>,
    ) -> RequestBody {
        match body {
            Body::Empty => Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
            Body::Bytes(bytes) => Full::new(bytes)
                .map_err(|never| match never {})
                .boxed_unsync(),
            Body::Stream { stream, .. } => {
                let mut loaded = 0u64;
                let frames = stream.map(move |chunk| {
                    if cancel.is_cancelled() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            "request cancelled",
                        ));
                    }
                    let chunk = chunk?;
                    loaded += chunk.len() as u64;
                    if let Some(observer) = &observer {
                        let progress = match total {
                            Some(total) => TransferProgress::new(loaded, total),
                            None => TransferProgress::unbounded(loaded),
                        };
                        observer.on_progress(&progress);
                    }
                    Ok(Frame::data(chunk))
                });
                StreamBody::new(frames).boxed_unsync()
            }
        }
    }

    async fn exchange(&self, req: Request<RequestBody>, output: Option<OutputSink>) -> Result<Response> {
        let response = self.client.request(req).await?;
        let status = response.status();
        let http_headers = fix_headers(response.headers());

        if status.is_success() {
            if let Some(mut sink) = output {
                let mut body = BodyStream::new(response.into_body());
                while let Some(frame) = body.next().await {
                    let frame = frame?;
                    if let Some(chunk) = frame.data_ref() {
                        sink.write_all(chunk).await?;
                    }
                }
                sink.flush().await?;
                sink.shutdown().await?;
                return Ok(Response {
                    http_headers,
                    body: ResponseBody::Empty,
                });
            }
        }

        let raw = response.collect().await?.to_bytes();
        parse_response(status, http_headers, raw)
    }
}

/// Encode query parameters for the URL, in key order
pub fn encode_query(params: &Params) -> String {
    let mut qs = String::new();
    for (k, v) in params {
        if !qs.is_empty() {
            qs.push('&');
        }
        qs.push_str(&urlencoding::encode(k));
        qs.push('=');
        qs.push_str(&urlencoding::encode(v));
    }
    qs
}

/// Lower-case names, trim values, drop empty ones, unquote `etag`.
pub fn fix_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut fixed = BTreeMap::new();
    for (name, value) in headers {
        let value = match value.to_str() {
            Ok(v) => v.trim(),
            Err(_) => continue,
        };
        if value.is_empty() {
            continue;
        }
        let key = name.as_str().to_ascii_lowercase();
        let value = if key == ETAG {
            value.replace('"', "")
        } else {
            value.to_string()
        };
        fixed.insert(key, value);
    }
    fixed
}

fn is_json(content_type: Option<&String>) -> bool {
    content_type
        .map(|ct| ct.contains("application/json") || ct.contains("text/json"))
        .unwrap_or(false)
}

/// Decode a buffered response into the success envelope or a failure.
///
/// A JSON body that fails to parse is an error even on 2xx.
pub fn parse_response(
    status: StatusCode,
    http_headers: BTreeMap<String, String>,
    raw: Bytes,
) -> Result<Response> {
    let body = if raw.is_empty() {
        ResponseBody::Empty
    } else if is_json(http_headers.get(CONTENT_TYPE)) {
        ResponseBody::Json(serde_json::from_slice(&raw)?)
    } else {
        ResponseBody::Raw(raw)
    };

    let code = status.as_u16();
    if status.is_informational() {
        return Err(BceError::service(code, INFORMATIONAL_STATUS_MESSAGE));
    }
    if !status.is_success() {
        let mut err = service_error(code, &body);
        if let BceError::Service { request_id, .. } = &mut err {
            if request_id.is_none() {
                *request_id = http_headers.get(X_BCE_REQUEST_ID).cloned();
            }
        }
        return Err(err);
    }

    Ok(Response { http_headers, body })
}

fn service_error(status_code: u16, body: &ResponseBody) -> BceError {
    match body {
        ResponseBody::Json(json) if json.get("requestId").is_some() => {
            let field = |name: &str| json.get(name).and_then(|v| v.as_str()).map(str::to_string);
            BceError::Service {
                status_code,
                message: field("message").unwrap_or_default(),
                code: field("code"),
                request_id: field("requestId"),
            }
        }
        ResponseBody::Json(json) => BceError::service(status_code, json.to_string()),
        ResponseBody::Raw(raw) => BceError::service(status_code, String::from_utf8_lossy(raw)),
        ResponseBody::Empty => BceError::service(
            status_code,
            StatusCode::from_u16(status_code)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default(),
        ),
    }
}
