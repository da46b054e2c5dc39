//! bce-sdk - Baidu Cloud object storage client with adaptive multipart upload

pub mod bce;
pub mod config;
pub mod core;
pub mod upload;

pub use crate::config::{ClientConfig, Config};
pub use crate::core::Core;
pub use crate::upload::{MultipartConfig, Payload, UploadOutcome, Uploader};
