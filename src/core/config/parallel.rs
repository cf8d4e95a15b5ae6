//! Parallelism knobs for job execution.

use serde::{Deserialize, Serialize};

/// Controls how much of a job may run concurrently.
///
/// The default is fully sequential page processing, which keeps output
/// deterministic. Page-level parallelism is opt-in. Remote OCR calls are
/// always funneled through a bounded semaphore because the remote engine is
/// a shared, rate-limited resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelPolicy {
    /// Maximum number of pages processed concurrently.
    /// `None` (the default) processes pages one at a time.
    #[serde(default)]
    pub max_parallel_pages: Option<usize>,

    /// Maximum in-flight remote OCR calls per job.
    #[serde(default = "ParallelPolicy::default_remote_inflight")]
    pub remote_inflight: usize,
}

impl ParallelPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallel_pages(mut self, pages: Option<usize>) -> Self {
        self.max_parallel_pages = pages;
        self
    }

    pub fn with_remote_inflight(mut self, inflight: usize) -> Self {
        self.remote_inflight = inflight.max(1);
        self
    }

    /// Effective page concurrency; always at least one.
    pub fn page_concurrency(&self) -> usize {
        self.max_parallel_pages.unwrap_or(1).max(1)
    }

    fn default_remote_inflight() -> usize {
        2
    }
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            max_parallel_pages: None,
            remote_inflight: Self::default_remote_inflight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sequential() {
        let policy = ParallelPolicy::default();
        assert_eq!(policy.page_concurrency(), 1);
        assert_eq!(policy.remote_inflight, 2);
    }

    #[test]
    fn inflight_never_drops_to_zero() {
        let policy = ParallelPolicy::new().with_remote_inflight(0);
        assert_eq!(policy.remote_inflight, 1);
    }
}
