//! Job progress reporting.
//!
//! The core pushes coarse percentage updates to an optional sink owned by
//! the surrounding job façade. Each pipeline stage owns a fixed percentage
//! bucket, so consumers see monotonic progress even though stages differ
//! wildly in duration. Counters are advisory and updated with relaxed
//! ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One progress event.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    /// Overall completion in `[0, 100]`.
    pub percent: u8,
    pub stage: &'static str,
}

/// Callback invoked on every progress event.
pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Pipeline stage with its percentage bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Rasterize,
    Layout,
    LocalOcr,
    RemoteOcr,
    Package,
}

impl ProgressStage {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressStage::Rasterize => "rasterize",
            ProgressStage::Layout => "layout",
            ProgressStage::LocalOcr => "local_ocr",
            ProgressStage::RemoteOcr => "remote_ocr",
            ProgressStage::Package => "package",
        }
    }

    /// Inclusive percentage bucket owned by this stage.
    pub fn bucket(&self) -> (u8, u8) {
        match self {
            ProgressStage::Rasterize => (0, 10),
            ProgressStage::Layout => (10, 30),
            ProgressStage::LocalOcr => (30, 60),
            ProgressStage::RemoteOcr => (60, 90),
            ProgressStage::Package => (90, 100),
        }
    }

    /// Maps a completed fraction of this stage onto the overall percentage.
    pub fn percent(&self, done: usize, total: usize) -> u8 {
        let (lo, hi) = self.bucket();
        if total == 0 {
            return hi;
        }
        let fraction = (done.min(total) as f64) / (total as f64);
        lo + ((hi - lo) as f64 * fraction).round() as u8
    }
}

/// Shared progress state for one job.
pub struct ProgressTracker {
    job_id: String,
    sink: Option<ProgressSink>,
    pub pages_rasterized: AtomicUsize,
    pub pages_laid_out: AtomicUsize,
    pub columns_local_done: AtomicUsize,
    pub columns_remote_done: AtomicUsize,
}

impl ProgressTracker {
    pub fn new(job_id: impl Into<String>, sink: Option<ProgressSink>) -> Self {
        Self {
            job_id: job_id.into(),
            sink,
            pages_rasterized: AtomicUsize::new(0),
            pages_laid_out: AtomicUsize::new(0),
            columns_local_done: AtomicUsize::new(0),
            columns_remote_done: AtomicUsize::new(0),
        }
    }

    /// Bumps a counter and emits the stage's mapped percentage.
    pub fn advance(&self, stage: ProgressStage, counter: &AtomicUsize, total: usize) {
        let done = counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.emit(stage, done, total);
    }

    pub fn emit(&self, stage: ProgressStage, done: usize, total: usize) {
        if let Some(sink) = &self.sink {
            sink(ProgressUpdate {
                job_id: self.job_id.clone(),
                percent: stage.percent(done, total),
                stage: stage.label(),
            });
        }
    }
}
