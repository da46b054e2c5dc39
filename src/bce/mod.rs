//! BCE client core
//!
//! This module provides:
//! - bce-auth-v1 request signing
//! - A pooled HTTP transport with streaming bodies and typed failures
//! - MD5 content digests for the integrity header
//! - The object storage calls the upload orchestrator is built on

pub mod bos;
pub mod client;
pub mod digest;
pub mod headers;
pub mod observer;
pub mod signer;
pub mod types;

// Re-export main types for convenience
pub use bos::{BosClient, CallOptions};
pub use client::{BceError, HttpClient, Result, Transport};
pub use digest::DigestEncoding;
pub use observer::{NoOpObserver, TransferObserver, TransferProgress};
pub use signer::{BceSigner, SignOptions, Signable};
pub use types::{
    BceRequest, Body, ByteStream, Credentials, Headers, Params, Response, ResponseBody,
    // Multipart upload types
    CompleteMultipartUploadResponse, CompletedPart, InitiateMultipartUploadResponse,
    ListPartsResponse, PartSummary,
};
