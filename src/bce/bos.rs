//! Object storage operations used by uploads
//!
//! Each method is a thin mapping of a verb, a resource path and query
//! parameters onto [`Transport::send`]. Validation that can be done locally
//! happens here, before anything reaches the network.

use bytes::Bytes;
use hyper::Method;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::bce::client::{BceError, Result, Transport};
use crate::bce::digest::{digest_bytes, digest_file, digest_file_range, DigestEncoding};
use crate::bce::headers::{CONTENT_LENGTH, CONTENT_MD5, CONTENT_TYPE, OCTET_STREAM, X_BCE_META_PREFIX};
use crate::bce::observer::TransferObserver;
use crate::bce::types::{
    resource_path, BceRequest, Body, ByteStream, CompleteMultipartUploadRequest,
    CompleteMultipartUploadResponse, CompletedPart, Headers, InitiateMultipartUploadResponse,
    ListPartsResponse, Response, ResponseBody,
};

/// Largest object a single PUT accepts (5 GiB)
pub const MAX_PUT_OBJECT_LENGTH: u64 = 5 * 1024 * 1024 * 1024;

/// Upper bound on the combined size of `x-bce-meta-*` names and values
pub const MAX_USER_METADATA_SIZE: usize = 2 * 1024;

/// Part numbers run from 1 to this value
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Per-call observer and cancellation
#[derive(Clone, Default)]
pub struct CallOptions {
    pub observer: Option<Arc<dyn TransferObserver>>,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn apply(&self, request: BceRequest) -> BceRequest {
        request
            .observer(self.observer.clone())
            .cancel_token(self.cancel.clone())
    }
}

/// Object storage client over any [`Transport`]
#[derive(Debug, Clone)]
pub struct BosClient<T> {
    transport: T,
}

impl<T: Transport> BosClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// PUT an object with an already prepared body.
    ///
    /// `Content-Length` is taken from the headers, else from the body.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Body,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<Response> {
        check_target(bucket, key)?;
        let mut headers = lowercase(headers);
        if !headers.contains_key(CONTENT_LENGTH) {
            let length = body.content_length().ok_or_else(|| {
                BceError::InvalidArgument("No Content-Length is specified.".to_string())
            })?;
            headers.insert(CONTENT_LENGTH.to_string(), length.to_string());
        }
        check_object_headers(&mut headers)?;

        tracing::debug!(bucket = %bucket, key = %key, body = ?body, "put_object");
        let request = BceRequest::new(Method::PUT, &resource_path(bucket, key))
            .headers(headers)
            .body(body);
        self.transport.send(options.apply(request)).await
    }

    /// PUT an in-memory object, computing `Content-MD5` unless supplied.
    pub async fn put_object_from_bytes(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<Response> {
        let mut headers = lowercase(headers);
        headers
            .entry(CONTENT_MD5.to_string())
            .or_insert_with(|| digest_bytes(&data, DigestEncoding::Base64));
        headers.insert(CONTENT_LENGTH.to_string(), data.len().to_string());
        self.put_object(bucket, key, Body::Bytes(data), headers, options)
            .await
    }

    /// PUT a file. The digest is computed over one handle and the body is
    /// streamed from a second, freshly opened one.
    pub async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<Response> {
        let mut headers = lowercase(headers);
        let file_len = tokio::fs::metadata(path).await?.len();
        let length = match headers.get(CONTENT_LENGTH) {
            Some(v) => parse_length(v)?,
            None => file_len,
        };
        if length > file_len {
            return Err(BceError::InvalidArgument(format!(
                "Content-Length {} exceeds file size {}",
                length, file_len
            )));
        }
        headers.insert(CONTENT_LENGTH.to_string(), length.to_string());

        if !headers.contains_key(CONTENT_MD5) {
            let md5 = if length == file_len {
                digest_file(path, DigestEncoding::Base64).await?
            } else {
                let (md5, measured) =
                    digest_file_range(path, 0, length, DigestEncoding::Base64).await?;
                if measured != length {
                    return Err(BceError::InvalidArgument(format!(
                        "file shrank to {} bytes while reading {}",
                        measured, length
                    )));
                }
                md5
            };
            headers.insert(CONTENT_MD5.to_string(), md5);
        }

        let stream = open_range(path, 0, length).await?;
        self.put_object(bucket, key, Body::stream(stream, Some(length)), headers, options)
            .await
    }

    /// PUT from a one-shot stream. No digest is computed here; pass
    /// `Content-MD5` in `headers` to have the service verify the data.
    pub async fn put_object_from_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        content_length: u64,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<Response> {
        let mut headers = lowercase(headers);
        headers.insert(CONTENT_LENGTH.to_string(), content_length.to_string());
        self.put_object(
            bucket,
            key,
            Body::stream(stream, Some(content_length)),
            headers,
            options,
        )
        .await
    }

    /// Start a multipart upload and return its `uploadId`.
    pub async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<InitiateMultipartUploadResponse> {
        check_target(bucket, key)?;
        let mut headers = lowercase(headers);
        headers
            .entry(CONTENT_TYPE.to_string())
            .or_insert_with(|| OCTET_STREAM.to_string());

        let request = BceRequest::new(Method::POST, &resource_path(bucket, key))
            .param("uploads", "")
            .headers(headers);
        let response = self.transport.send(options.apply(request)).await?;
        let initiated: InitiateMultipartUploadResponse = response.body.decode()?;

        tracing::info!(
            bucket = %bucket,
            key = %key,
            upload_id = %initiated.upload_id,
            "multipart_upload_initiated"
        );
        Ok(initiated)
    }

    /// Upload one part from memory.
    pub async fn upload_part_from_bytes(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        options: &CallOptions,
    ) -> Result<Response> {
        check_part(bucket, key, upload_id, part_number)?;
        let request = BceRequest::new(Method::PUT, &resource_path(bucket, key))
            .param("partNumber", part_number.to_string())
            .param("uploadId", upload_id)
            .header(CONTENT_LENGTH, data.len().to_string())
            .header(CONTENT_MD5, digest_bytes(&data, DigestEncoding::Base64))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(data);
        self.transport.send(options.apply(request)).await
    }

    /// Upload `part_size` bytes of `path` starting at `offset`.
    ///
    /// The digest pass and the body stream each open their own handle.
    /// A range that ends past EOF fails with [`BceError::Integrity`] before
    /// the request is sent.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part_from_file(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        path: &Path,
        offset: u64,
        part_size: u64,
        options: &CallOptions,
    ) -> Result<Response> {
        check_part(bucket, key, upload_id, part_number)?;

        let (md5, measured) =
            digest_file_range(path, offset, part_size, DigestEncoding::Base64).await?;
        if measured != part_size {
            return Err(BceError::Integrity {
                part_number,
                expected: part_size,
                actual: measured,
            });
        }

        let stream = open_range(path, offset, part_size).await?;
        let request = BceRequest::new(Method::PUT, &resource_path(bucket, key))
            .param("partNumber", part_number.to_string())
            .param("uploadId", upload_id)
            .header(CONTENT_LENGTH, part_size.to_string())
            .header(CONTENT_MD5, md5)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(Body::stream(stream, Some(part_size)));
        self.transport.send(options.apply(request)).await
    }

    /// Assemble the object from uploaded parts. `parts` is sent in ascending
    /// part number order whatever order it arrives in.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        options: &CallOptions,
    ) -> Result<CompleteMultipartUploadResponse> {
        check_target(bucket, key)?;
        if upload_id.is_empty() {
            return Err(BceError::InvalidArgument("uploadId should not be empty".to_string()));
        }
        if parts.is_empty() {
            return Err(BceError::InvalidArgument("parts should not be empty".to_string()));
        }

        let mut parts = parts.to_vec();
        parts.sort_by_key(|p| p.part_number);
        let payload = serde_json::to_vec(&CompleteMultipartUploadRequest { parts })?;

        let request = BceRequest::new(Method::POST, &resource_path(bucket, key))
            .param("uploadId", upload_id)
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .header(CONTENT_LENGTH, payload.len().to_string())
            .body(payload);
        let response = self.transport.send(options.apply(request)).await?;

        let mut completed = match &response.body {
            ResponseBody::Json(_) => response.body.decode::<CompleteMultipartUploadResponse>()?,
            _ => CompleteMultipartUploadResponse::default(),
        };
        if completed.e_tag.is_empty() {
            if let Some(etag) = response.etag() {
                completed.e_tag = etag.to_string();
            }
        }

        tracing::info!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload_id,
            etag = %completed.e_tag,
            "multipart_upload_completed"
        );
        Ok(completed)
    }

    /// Discard a multipart upload and its parts.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        options: &CallOptions,
    ) -> Result<()> {
        check_target(bucket, key)?;
        if upload_id.is_empty() {
            return Err(BceError::InvalidArgument("uploadId should not be empty".to_string()));
        }
        let request = BceRequest::new(Method::DELETE, &resource_path(bucket, key))
            .param("uploadId", upload_id);
        self.transport.send(options.apply(request)).await?;

        tracing::info!(bucket = %bucket, key = %key, upload_id = %upload_id, "multipart_upload_aborted");
        Ok(())
    }

    /// List the parts uploaded so far.
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        max_parts: Option<u32>,
        part_number_marker: Option<u32>,
        options: &CallOptions,
    ) -> Result<ListPartsResponse> {
        check_target(bucket, key)?;
        if upload_id.is_empty() {
            return Err(BceError::InvalidArgument("uploadId should not be empty".to_string()));
        }
        let mut request = BceRequest::new(Method::GET, &resource_path(bucket, key))
            .param("uploadId", upload_id);
        if let Some(max) = max_parts {
            request = request.param("maxParts", max.to_string());
        }
        if let Some(marker) = part_number_marker {
            request = request.param("partNumberMarker", marker.to_string());
        }
        let response = self.transport.send(options.apply(request)).await?;
        response.body.decode()
    }
}

/// Open `path`, seek to `offset` and stream at most `len` bytes.
pub async fn open_range(path: &Path, offset: u64, len: u64) -> Result<ByteStream> {
    let mut file = tokio::fs::File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(Box::pin(ReaderStream::new(file.take(len))))
}

fn lowercase(headers: Headers) -> Headers {
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

fn parse_length(value: &str) -> Result<u64> {
    let length: i64 = value.trim().parse().map_err(|_| {
        BceError::InvalidArgument(format!("Invalid Content-Length: {}", value))
    })?;
    if length < 0 {
        return Err(BceError::InvalidArgument(
            "content_length should not be negative.".to_string(),
        ));
    }
    Ok(length as u64)
}

fn check_target(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(BceError::InvalidArgument("bucket should not be empty".to_string()));
    }
    if key.is_empty() {
        return Err(BceError::InvalidArgument("key should not be empty".to_string()));
    }
    Ok(())
}

fn check_part(bucket: &str, key: &str, upload_id: &str, part_number: u32) -> Result<()> {
    check_target(bucket, key)?;
    if upload_id.is_empty() {
        return Err(BceError::InvalidArgument("uploadId should not be empty".to_string()));
    }
    if !(1..=MAX_PART_NUMBER).contains(&part_number) {
        return Err(BceError::InvalidArgument(format!(
            "Invalid partNumber {}. The valid range is from 1 to {}",
            part_number, MAX_PART_NUMBER
        )));
    }
    Ok(())
}

/// Validate object headers and fill in the default content type.
pub fn check_object_headers(headers: &mut Headers) -> Result<()> {
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length = parse_length(value)?;
        if length > MAX_PUT_OBJECT_LENGTH {
            return Err(BceError::InvalidArgument(format!(
                "Your proposed upload exceeds the maximum allowed object size ({} bytes)",
                MAX_PUT_OBJECT_LENGTH
            )));
        }
    }

    let metadata_size: usize = headers
        .iter()
        .filter(|(k, _)| k.starts_with(X_BCE_META_PREFIX))
        .map(|(k, v)| k.len() + v.len())
        .sum();
    if metadata_size > MAX_USER_METADATA_SIZE {
        return Err(BceError::InvalidArgument(format!(
            "Metadata size should not be greater than {} bytes",
            MAX_USER_METADATA_SIZE
        )));
    }

    headers
        .entry(CONTENT_TYPE.to_string())
        .or_insert_with(|| OCTET_STREAM.to_string());
    Ok(())
}
