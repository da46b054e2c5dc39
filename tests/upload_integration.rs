//! Integration tests for the upload orchestrator
//!
//! A scripted in-process transport stands in for the service. It answers the
//! multipart calls, checks each part's Content-MD5 against the bytes it
//! received, and records concurrency.

use async_trait::async_trait;
use bce_sdk::bce::digest::{digest_bytes, DigestEncoding};
use bce_sdk::bce::headers::{CONTENT_LENGTH, CONTENT_MD5};
use bce_sdk::bce::observer::{progress_fn, TransferObserver, TransferProgress};
use bce_sdk::bce::{
    BceError, BceRequest, Body, BosClient, CallOptions, Headers, Response, ResponseBody, Result,
    Transport,
};
use bce_sdk::upload::{MultipartConfig, Payload, Strategy, Uploader, MIN_MULTIPART_SIZE};
use bytes::Bytes;
use futures::TryStreamExt;
use hyper::Method;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct Call {
    method: Method,
    params: BTreeMap<String, String>,
    headers: Headers,
    body: Vec<u8>,
}

#[derive(Default)]
struct MockTransport {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_part: Option<u32>,
    fail_complete: bool,
    /// Later parts finish first when set
    reverse_delays: bool,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    fn failing_on(part: u32) -> Self {
        Self {
            fail_part: Some(part),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn part_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.params.contains_key("partNumber"))
            .collect()
    }

    fn complete_call(&self) -> Option<Call> {
        self.calls()
            .into_iter()
            .find(|c| c.method == Method::POST && c.params.contains_key("uploadId"))
    }

    fn initiate_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.params.contains_key("uploads"))
            .count()
    }
}

fn reply(headers: &[(&str, &str)], body: ResponseBody) -> Response {
    Response {
        http_headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body,
    }
}

async fn read_body(body: Body) -> Result<Vec<u8>> {
    Ok(match body {
        Body::Empty => Vec::new(),
        Body::Bytes(b) => b.to_vec(),
        Body::Stream { stream, .. } => {
            let chunks: Vec<Bytes> = stream.try_collect().await?;
            chunks.concat()
        }
    })
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: BceRequest) -> Result<Response> {
        let BceRequest {
            method,
            params,
            headers,
            body,
            ..
        } = request;

        if let Some(part) = params.get("partNumber") {
            let part: u32 = part.parse().unwrap();
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let failing = self.fail_part == Some(part);
            let delay = if failing {
                0
            } else if self.reverse_delays {
                (20 - part as u64) * 3
            } else {
                15
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let data = read_body(body).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let data = data?;

            assert_eq!(
                headers.get(CONTENT_LENGTH).unwrap(),
                &data.len().to_string(),
                "part {part} length"
            );
            assert_eq!(
                headers.get(CONTENT_MD5).unwrap(),
                &digest_bytes(&data, DigestEncoding::Base64),
                "part {part} digest"
            );

            self.calls.lock().unwrap().push(Call {
                method,
                params,
                headers,
                body: data,
            });

            if failing {
                return Err(BceError::Service {
                    status_code: 500,
                    message: "We encountered an internal error.".to_string(),
                    code: Some("InternalError".to_string()),
                    request_id: Some("req-fail".to_string()),
                });
            }
            let etag = format!("etag-{part}");
            return Ok(reply(&[("etag", &etag)], ResponseBody::Empty));
        }

        let data = read_body(body).await?;
        let response = if params.contains_key("uploads") {
            reply(
                &[],
                ResponseBody::Json(serde_json::json!({
                    "bucket": "bucket", "key": "key", "uploadId": "upload-1"
                })),
            )
        } else if params.contains_key("uploadId") && self.fail_complete {
            self.calls.lock().unwrap().push(Call {
                method,
                params,
                headers,
                body: data,
            });
            return Err(BceError::Service {
                status_code: 400,
                message: "One or more of the specified parts could not be found.".to_string(),
                code: Some("InvalidPart".to_string()),
                request_id: Some("req-complete".to_string()),
            });
        } else if params.contains_key("uploadId") {
            reply(
                &[],
                ResponseBody::Json(serde_json::json!({
                    "bucket": "bucket", "key": "key", "eTag": "final-etag",
                    "location": "http://bj.bcebos.com/bucket/key"
                })),
            )
        } else {
            reply(&[("etag", "direct-etag")], ResponseBody::Empty)
        };

        self.calls.lock().unwrap().push(Call {
            method,
            params,
            headers,
            body: data,
        });
        Ok(response)
    }
}

/// Log output for `RUST_LOG=bce_sdk=debug cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn uploader(mock: &Arc<MockTransport>) -> Uploader<Arc<MockTransport>> {
    Uploader::new(BosClient::new(mock.clone()))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

fn part_numbers(complete: &Call) -> Vec<u64> {
    let body: serde_json::Value = serde_json::from_slice(&complete.body).unwrap();
    body["parts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["partNumber"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_threshold_payload_goes_direct() {
    let mock = Arc::new(MockTransport::default());
    let data = payload(MIN_MULTIPART_SIZE as usize);

    let outcome = uploader(&mock)
        .upload("bucket", "key", Payload::from(data.clone()), Headers::new(), &CallOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), Strategy::Direct);
    assert_eq!(outcome.etag(), Some("direct-etag"));

    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, Method::PUT);
    assert_eq!(
        calls[0].headers.get(CONTENT_MD5).unwrap(),
        &digest_bytes(&data, DigestEncoding::Base64)
    );
    assert_eq!(calls[0].body.len(), data.len());
}

#[tokio::test]
async fn test_twelve_mib_uploads_twelve_sorted_parts() {
    init_tracing();
    let mock = Arc::new(MockTransport {
        reverse_delays: true,
        ..MockTransport::default()
    });
    let data = payload(12 * MIB);

    let progress: Arc<Mutex<Vec<TransferProgress>>> = Arc::default();
    let seen = progress.clone();
    let observer: Arc<dyn TransferObserver> = Arc::new(progress_fn(move |p: &TransferProgress| {
        seen.lock().unwrap().push(*p);
    }));

    let outcome = uploader(&mock)
        .upload(
            "bucket",
            "key",
            Payload::from(data.clone()),
            Headers::new(),
            &CallOptions::new().with_observer(observer),
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), Strategy::Multipart);
    assert_eq!(outcome.etag(), Some("final-etag"));
    assert_eq!(mock.initiate_calls(), 1);
    assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 2);

    let parts = mock.part_calls();
    assert_eq!(parts.len(), 12);
    assert!(parts.iter().all(|c| c.body.len() == MIB));

    // Completion lists parts in order even though they finished out of order
    let finished: Vec<u32> = parts.iter().map(|c| c.params["partNumber"].parse().unwrap()).collect();
    assert_ne!(finished, (1..=12).collect::<Vec<u32>>());
    let complete = mock.complete_call().unwrap();
    assert_eq!(part_numbers(&complete), (1..=12).collect::<Vec<u64>>());

    // Reassembling by part number gives back the payload
    let mut sorted = parts.clone();
    sorted.sort_by_key(|c| c.params["partNumber"].parse::<u32>().unwrap());
    let joined: Vec<u8> = sorted.into_iter().flat_map(|c| c.body).collect();
    assert_eq!(joined, data);

    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 12);
    for (i, p) in progress.iter().enumerate() {
        assert_eq!(*p, TransferProgress::new(i as u64 + 1, 12));
    }
}

#[tokio::test]
async fn test_failed_part_stops_scheduling_and_skips_completion() {
    init_tracing();
    let mock = Arc::new(MockTransport::failing_on(3));
    let data = payload(12 * MIB);

    let errored = Arc::new(AtomicBool::new(false));
    struct ErrorFlag(Arc<AtomicBool>);
    impl TransferObserver for ErrorFlag {
        fn on_error(&self, _error: &BceError) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let err = uploader(&mock)
        .upload(
            "bucket",
            "key",
            Payload::from(data),
            Headers::new(),
            &CallOptions::new().with_observer(Arc::new(ErrorFlag(errored.clone()))),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(500));
    assert_eq!(err.code(), Some("InternalError"));
    assert!(errored.load(Ordering::SeqCst));
    assert!(mock.complete_call().is_none());
    assert!(mock.part_calls().len() <= 4, "scheduled {} parts", mock.part_calls().len());
    assert!(mock.max_in_flight.load(Ordering::SeqCst) <= 2);

    // Nothing aborts the session on the caller's behalf
    assert!(mock.calls().iter().all(|c| c.method != Method::DELETE));
}

#[tokio::test]
async fn test_failed_completion_reaches_observer() {
    let mock = Arc::new(MockTransport {
        fail_complete: true,
        ..MockTransport::default()
    });

    let errors = Arc::new(AtomicUsize::new(0));
    struct ErrorCount(Arc<AtomicUsize>);
    impl TransferObserver for ErrorCount {
        fn on_error(&self, _error: &BceError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let err = uploader(&mock)
        .upload(
            "bucket",
            "key",
            Payload::from(payload(6 * MIB)),
            Headers::new(),
            &CallOptions::new().with_observer(Arc::new(ErrorCount(errors.clone()))),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("InvalidPart"));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(mock.part_calls().len(), 6);
    assert!(mock.complete_call().is_some());
    assert!(mock.calls().iter().all(|c| c.method != Method::DELETE));
}

#[tokio::test]
async fn test_file_multipart_reads_fresh_ranges() {
    init_tracing();
    let data = payload(6 * MIB + 100);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let mock = Arc::new(MockTransport::default());
    let outcome = uploader(&mock)
        .upload("bucket", "big.bin", Payload::file(file.path()), Headers::new(), &CallOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), Strategy::Multipart);
    let mut parts = mock.part_calls();
    assert_eq!(parts.len(), 7);
    parts.sort_by_key(|c| c.params["partNumber"].parse::<u32>().unwrap());
    assert_eq!(parts[6].body.len(), 100);
    let joined: Vec<u8> = parts.into_iter().flat_map(|c| c.body).collect();
    assert_eq!(joined, data);
}

#[tokio::test]
async fn test_small_file_goes_direct_with_digest() {
    let data = payload(1000);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let mock = Arc::new(MockTransport::default());
    let outcome = uploader(&mock)
        .upload("bucket", "small.bin", Payload::file(file.path()), Headers::new(), &CallOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), Strategy::Direct);
    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body, data);
    assert_eq!(
        calls[0].headers.get(CONTENT_MD5).unwrap(),
        &digest_bytes(&data, DigestEncoding::Base64)
    );
}

#[tokio::test]
async fn test_stream_goes_direct_without_digest() {
    let chunks: Vec<std::io::Result<Bytes>> = (0..8)
        .map(|_| Ok(Bytes::from(vec![1u8; MIB])))
        .collect();
    let stream = Box::pin(futures::stream::iter(chunks));

    let mock = Arc::new(MockTransport::default());
    let outcome = uploader(&mock)
        .upload(
            "bucket",
            "stream.bin",
            Payload::stream(stream, Some(8 * MIB as u64)),
            Headers::new(),
            &CallOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), Strategy::Direct);
    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body.len(), 8 * MIB);
    assert!(!calls[0].headers.contains_key(CONTENT_MD5));
    assert_eq!(calls[0].headers.get(CONTENT_LENGTH).unwrap(), &(8 * MIB).to_string());
}

#[tokio::test]
async fn test_stream_without_length_is_rejected() {
    let stream = Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"x"))]));
    let mock = Arc::new(MockTransport::default());

    let err = uploader(&mock)
        .upload("bucket", "s", Payload::stream(stream, None), Headers::new(), &CallOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BceError::InvalidArgument(_)));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_stops_scheduling() {
    let mock = Arc::new(MockTransport::default());
    let cancel = CancellationToken::new();
    let aborted = Arc::new(AtomicBool::new(false));

    struct CancelAfterFirst {
        cancel: CancellationToken,
        aborted: Arc<AtomicBool>,
    }
    impl TransferObserver for CancelAfterFirst {
        fn on_progress(&self, _progress: &TransferProgress) {
            self.cancel.cancel();
        }
        fn on_abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    let observer = Arc::new(CancelAfterFirst {
        cancel: cancel.clone(),
        aborted: aborted.clone(),
    });
    let err = uploader(&mock)
        .upload(
            "bucket",
            "key",
            Payload::from(payload(12 * MIB)),
            Headers::new(),
            &CallOptions::new().with_observer(observer).with_cancel(cancel),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BceError::Cancelled));
    assert!(aborted.load(Ordering::SeqCst));
    assert!(mock.complete_call().is_none());
    assert!(mock.part_calls().len() <= 3);
}

#[tokio::test]
async fn test_custom_config_widens_pool() {
    let mock = Arc::new(MockTransport::default());
    let config = MultipartConfig::default()
        .with_threshold(MIB as u64)
        .with_part_size(256 * 1024)
        .with_concurrency(4);

    let outcome = uploader(&mock)
        .with_config(config)
        .upload("bucket", "key", Payload::from(payload(2 * MIB)), Headers::new(), &CallOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome.strategy(), Strategy::Multipart);
    assert_eq!(mock.part_calls().len(), 8);
    assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 4);
}
