//! Transfer notifications
//!
//! Transports and the upload orchestrator report progress, failures and
//! cancellation through a [`TransferObserver`] handed in by the caller.

use crate::bce::client::BceError;

/// Progress snapshot.
///
/// For a single exchange `loaded`/`total` count body bytes; for a multipart
/// upload they count finished parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Whether `total` is meaningful
    pub length_computable: bool,
    pub loaded: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn new(loaded: u64, total: u64) -> Self {
        Self {
            length_computable: true,
            loaded,
            total,
        }
    }

    /// Progress without a known total
    pub fn unbounded(loaded: u64) -> Self {
        Self {
            length_computable: false,
            loaded,
            total: 0,
        }
    }

    /// Completion ratio in `0.0..=1.0`, if computable
    pub fn fraction(&self) -> Option<f64> {
        if !self.length_computable || self.total == 0 {
            return None;
        }
        Some(self.loaded as f64 / self.total as f64)
    }
}

/// Receiver of transfer notifications.
///
/// All methods have empty defaults so implementors pick what they need.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, _progress: &TransferProgress) {}

    fn on_error(&self, _error: &BceError) {}

    fn on_abort(&self) {}
}

/// An observer that ignores everything.
pub struct NoOpObserver;

impl TransferObserver for NoOpObserver {}

/// An observer that forwards progress to a closure.
pub struct FnObserver<F> {
    callback: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> TransferObserver for FnObserver<F>
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &TransferProgress) {
        (self.callback)(progress)
    }
}

/// Create a progress-only observer from a closure.
pub fn progress_fn<F>(f: F) -> FnObserver<F>
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    FnObserver::new(f)
}
