//! Progress reporting for stacking runs.

use std::sync::Arc;

/// Snapshot passed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackProgress {
    /// Match groups consumed so far, including those restored from a checkpoint.
    pub groups_done: u64,
    /// Pairs consumed so far (accumulated plus skipped).
    pub pairs_seen: u64,
    pub total_matches: u64,
}

impl StackProgress {
    pub fn percent(&self) -> f64 {
        if self.total_matches == 0 {
            100.0
        } else {
            self.pairs_seen as f64 * 100.0 / self.total_matches as f64
        }
    }
}

/// Callback type for progress reporting.
pub type ProgressCallback = Arc<dyn Fn(StackProgress) + Send + Sync>;

/// Report progress using the callback if set.
pub fn report_progress(callback: Option<&ProgressCallback>, progress: StackProgress) {
    if let Some(f) = callback {
        f(progress);
    }
}
