//! Adaptive object upload
//!
//! Small and unsized payloads go up in a single PUT. Anything larger than
//! the multipart threshold is split into fixed-size parts that are uploaded
//! through a bounded pool and then assembled with one completion call.
//!
//! A failed part fails the whole upload. The multipart session is left open
//! so the caller can abort it (or inspect it with `list_parts`).

pub mod task;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bce::bos::{BosClient, CallOptions};
use crate::bce::client::{BceError, Result, Transport};
use crate::bce::types::{
    Body, ByteStream, CompleteMultipartUploadResponse, CompletedPart, Headers, Response,
};

pub use task::{check_plan, part_count, partition, UploadSession, UploadTask};

/// Payloads at or below this size are sent in one request (5 MiB)
pub const MIN_MULTIPART_SIZE: u64 = 5 * 1024 * 1024;

/// Size of every part except possibly the last (1 MiB)
pub const PART_SIZE: u64 = 1024 * 1024;

/// Part uploads in flight at once
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Multipart tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartConfig {
    /// Largest payload still sent directly
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Maximum concurrent part uploads
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_threshold() -> u64 {
    MIN_MULTIPART_SIZE
}

fn default_part_size() -> u64 {
    PART_SIZE
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            part_size: default_part_size(),
            concurrency: default_concurrency(),
        }
    }
}

impl MultipartConfig {
    pub fn with_part_size(mut self, size: u64) -> Self {
        self.part_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Copy with the lower bounds applied
    pub fn normalized(&self) -> Self {
        Self {
            threshold: self.threshold,
            part_size: self.part_size.max(1),
            concurrency: self.concurrency.max(1),
        }
    }

    /// Pick the strategy for a payload of `content_length` bytes;
    /// `None` means the length cannot be known upfront.
    pub fn strategy_for(&self, content_length: Option<u64>) -> Strategy {
        match content_length {
            Some(len) if len > self.threshold => Strategy::Multipart,
            _ => Strategy::Direct,
        }
    }
}

/// Data to upload
pub enum Payload {
    Bytes(Bytes),
    File(PathBuf),
    /// One-shot source; always sent directly
    Stream {
        stream: ByteStream,
        content_length: Option<u64>,
    },
}

impl Payload {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Payload::File(path.into())
    }

    pub fn stream(stream: ByteStream, content_length: Option<u64>) -> Self {
        Payload::Stream {
            stream,
            content_length,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(v))
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Payload::File(p) => write!(f, "Payload::File({})", p.display()),
            Payload::Stream { content_length, .. } => {
                write!(f, "Payload::Stream(length={:?})", content_length)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Multipart,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Direct => f.write_str("direct"),
            Strategy::Multipart => f.write_str("multipart"),
        }
    }
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Direct(Response),
    Multipart {
        upload_id: String,
        parts: Vec<CompletedPart>,
        response: CompleteMultipartUploadResponse,
    },
}

impl UploadOutcome {
    pub fn strategy(&self) -> Strategy {
        match self {
            UploadOutcome::Direct(_) => Strategy::Direct,
            UploadOutcome::Multipart { .. } => Strategy::Multipart,
        }
    }

    /// ETag of the stored object, when the service returned one
    pub fn etag(&self) -> Option<&str> {
        match self {
            UploadOutcome::Direct(response) => response.etag(),
            UploadOutcome::Multipart { response, .. } if !response.e_tag.is_empty() => {
                Some(&response.e_tag)
            }
            UploadOutcome::Multipart { .. } => None,
        }
    }
}

/// Where part bytes come from. Both can be re-read per part.
enum PartSource<'a> {
    Bytes(&'a Bytes),
    File(&'a Path),
}

/// Upload orchestrator
#[derive(Debug, Clone)]
pub struct Uploader<T> {
    client: BosClient<T>,
    config: MultipartConfig,
}

impl<T: Transport> Uploader<T> {
    pub fn new(client: BosClient<T>) -> Self {
        Self {
            client,
            config: MultipartConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MultipartConfig) -> Self {
        self.config = config.normalized();
        self
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    pub fn client(&self) -> &BosClient<T> {
        &self.client
    }

    /// Upload `payload` to `bucket/key`.
    ///
    /// `headers` go on the direct PUT or the initiate call. The observer in
    /// `options` sees byte progress for a direct upload and part-count
    /// progress for a multipart one.
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        payload: Payload,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<UploadOutcome> {
        match payload {
            Payload::Stream {
                stream,
                content_length,
            } => {
                tracing::debug!(bucket = %bucket, key = %key, strategy = "direct", "upload_stream");
                let response = self
                    .client
                    .put_object(
                        bucket,
                        key,
                        Body::stream(stream, content_length),
                        headers,
                        options,
                    )
                    .await?;
                Ok(UploadOutcome::Direct(response))
            }
            Payload::Bytes(data) => {
                let length = data.len() as u64;
                match self.config.strategy_for(Some(length)) {
                    Strategy::Direct => {
                        tracing::debug!(bucket = %bucket, key = %key, length, strategy = "direct", "upload_bytes");
                        let response = self
                            .client
                            .put_object_from_bytes(bucket, key, data, headers, options)
                            .await?;
                        Ok(UploadOutcome::Direct(response))
                    }
                    Strategy::Multipart => {
                        self.upload_multipart(bucket, key, PartSource::Bytes(&data), length, headers, options)
                            .await
                    }
                }
            }
            Payload::File(path) => {
                let length = tokio::fs::metadata(&path).await?.len();
                match self.config.strategy_for(Some(length)) {
                    Strategy::Direct => {
                        tracing::debug!(bucket = %bucket, key = %key, length, strategy = "direct", "upload_file");
                        let response = self
                            .client
                            .put_object_from_file(bucket, key, &path, headers, options)
                            .await?;
                        Ok(UploadOutcome::Direct(response))
                    }
                    Strategy::Multipart => {
                        self.upload_multipart(bucket, key, PartSource::File(&path), length, headers, options)
                            .await
                    }
                }
            }
        }
    }

    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        source: PartSource<'_>,
        content_length: u64,
        headers: Headers,
        options: &CallOptions,
    ) -> Result<UploadOutcome> {
        check_plan(content_length, self.config.part_size)?;

        let init_options = CallOptions::new().with_cancel(options.cancel.clone());
        let initiated = self
            .client
            .initiate_multipart_upload(bucket, key, headers, &init_options)
            .await
            .map_err(|e| notify_failure(options, e))?;

        let mut session = UploadSession::new(&initiated.upload_id, content_length, self.config.part_size);
        tracing::info!(
            bucket = %bucket,
            key = %key,
            upload_id = %session.upload_id(),
            content_length,
            parts = session.total_parts(),
            concurrency = self.config.concurrency,
            strategy = "multipart",
            "upload_multipart_started"
        );

        if let Err(e) = self.run_parts(bucket, key, &source, &mut session, options).await {
            tracing::warn!(
                bucket = %bucket,
                key = %key,
                upload_id = %session.upload_id(),
                completed = session.completed_parts(),
                total = session.total_parts(),
                error = %e,
                "upload_multipart_failed"
            );
            return Err(e);
        }

        let upload_id = session.upload_id().to_string();
        let parts = session.into_parts();
        let response = self
            .client
            .complete_multipart_upload(bucket, key, &upload_id, &parts, &init_options)
            .await
            .map_err(|e| notify_failure(options, e))?;

        Ok(UploadOutcome::Multipart {
            upload_id,
            parts,
            response,
        })
    }

    /// Drive every task through a pool of `concurrency` slots.
    ///
    /// Results are reduced here, on one task, so the session needs no lock.
    /// After the first failure (or cancellation) nothing new is scheduled;
    /// parts already in flight are drained before returning.
    async fn run_parts(
        &self,
        bucket: &str,
        key: &str,
        source: &PartSource<'_>,
        session: &mut UploadSession,
        options: &CallOptions,
    ) -> Result<()> {
        let part_options = CallOptions::new().with_cancel(options.cancel.clone());
        let mut pending = session.tasks().to_vec().into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<BceError> = None;

        loop {
            while failure.is_none()
                && !options.cancel.is_cancelled()
                && in_flight.len() < self.config.concurrency
            {
                match pending.next() {
                    Some(task) => in_flight.push(self.upload_task(bucket, key, source, task, &part_options)),
                    None => break,
                }
            }

            match in_flight.next().await {
                None => break,
                Some(Ok(part)) => {
                    tracing::debug!(
                        upload_id = %session.upload_id(),
                        part_number = part.part_number,
                        etag = %part.e_tag,
                        "upload_part_done"
                    );
                    let progress = session.record(part);
                    if let Some(observer) = &options.observer {
                        observer.on_progress(&progress);
                    }
                }
                Some(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if options.cancel.is_cancelled() {
            if let Some(observer) = &options.observer {
                observer.on_abort();
            }
            return Err(BceError::Cancelled);
        }

        if let Some(e) = failure {
            if let Some(observer) = &options.observer {
                observer.on_error(&e);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn upload_task(
        &self,
        bucket: &str,
        key: &str,
        source: &PartSource<'_>,
        task: UploadTask,
        options: &CallOptions,
    ) -> Result<CompletedPart> {
        let response = match source {
            PartSource::Bytes(data) => {
                let available = data.len() as u64;
                if task.range_end >= available {
                    return Err(BceError::Integrity {
                        part_number: task.part_number,
                        expected: task.part_size,
                        actual: available.saturating_sub(task.range_start),
                    });
                }
                let range = task.range();
                let slice = data.slice(range.start as usize..range.end as usize);
                self.client
                    .upload_part_from_bytes(bucket, key, &task.upload_id, task.part_number, slice, options)
                    .await?
            }
            PartSource::File(path) => {
                self.client
                    .upload_part_from_file(
                        bucket,
                        key,
                        &task.upload_id,
                        task.part_number,
                        path,
                        task.range_start,
                        task.part_size,
                        options,
                    )
                    .await?
            }
        };

        let etag = response.etag().ok_or_else(|| {
            BceError::InvalidResponse(format!("Part {} response has no ETag", task.part_number))
        })?;
        Ok(CompletedPart::new(task.part_number, etag))
    }
}

/// Report a failed multipart control call (initiate or complete) to the observer.
fn notify_failure(options: &CallOptions, e: BceError) -> BceError {
    if let Some(observer) = &options.observer {
        match &e {
            BceError::Cancelled => observer.on_abort(),
            _ => observer.on_error(&e),
        }
    }
    e
}
