//! Part planning and per-upload bookkeeping

use crate::bce::bos::MAX_PART_NUMBER;
use crate::bce::client::{BceError, Result};
use crate::bce::observer::TransferProgress;
use crate::bce::types::CompletedPart;

/// One byte range of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub upload_id: String,
    /// 1-based
    pub part_number: u32,
    pub part_size: u64,
    /// Offset of the first byte
    pub range_start: u64,
    /// Offset of the last byte (inclusive)
    pub range_end: u64,
}

impl UploadTask {
    /// Half-open range, for slicing
    pub fn range(&self) -> std::ops::Range<u64> {
        self.range_start..self.range_end + 1
    }
}

/// Number of parts `content_length` splits into
pub fn part_count(content_length: u64, part_size: u64) -> u64 {
    let part_size = part_size.max(1);
    content_length.div_ceil(part_size)
}

/// Reject plans the service would refuse before an upload is initiated.
pub fn check_plan(content_length: u64, part_size: u64) -> Result<()> {
    if part_size == 0 {
        return Err(BceError::InvalidArgument("part size should be positive".to_string()));
    }
    let count = part_count(content_length, part_size);
    if count > MAX_PART_NUMBER as u64 {
        return Err(BceError::InvalidArgument(format!(
            "{} bytes in parts of {} bytes needs {} parts, more than the maximum of {}",
            content_length, part_size, count, MAX_PART_NUMBER
        )));
    }
    Ok(())
}

/// Split `content_length` bytes into contiguous parts of `part_size`; the
/// last part takes the remainder.
pub fn partition(upload_id: &str, content_length: u64, part_size: u64) -> Vec<UploadTask> {
    let part_size = part_size.max(1);
    let mut tasks = Vec::with_capacity(part_count(content_length, part_size) as usize);
    let mut offset = 0u64;
    let mut part_number = 1u32;
    while offset < content_length {
        let size = part_size.min(content_length - offset);
        tasks.push(UploadTask {
            upload_id: upload_id.to_string(),
            part_number,
            part_size: size,
            range_start: offset,
            range_end: offset + size - 1,
        });
        offset += size;
        part_number += 1;
    }
    tasks
}

/// State of one multipart orchestration: its tasks, progress counters and
/// collected part tags. Owned by a single upload call.
#[derive(Debug)]
pub struct UploadSession {
    upload_id: String,
    tasks: Vec<UploadTask>,
    completed: Vec<CompletedPart>,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>, content_length: u64, part_size: u64) -> Self {
        let upload_id = upload_id.into();
        let tasks = partition(&upload_id, content_length, part_size);
        Self {
            completed: Vec::with_capacity(tasks.len()),
            upload_id,
            tasks,
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn tasks(&self) -> &[UploadTask] {
        &self.tasks
    }

    pub fn total_parts(&self) -> u64 {
        self.tasks.len() as u64
    }

    pub fn completed_parts(&self) -> u64 {
        self.completed.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.tasks.len()
    }

    /// Record a finished part and return the new progress.
    pub fn record(&mut self, part: CompletedPart) -> TransferProgress {
        self.completed.push(part);
        TransferProgress::new(self.completed_parts(), self.total_parts())
    }

    /// Collected parts in ascending part number order
    pub fn into_parts(mut self) -> Vec<CompletedPart> {
        self.completed.sort_by_key(|p| p.part_number);
        self.completed
    }
}
