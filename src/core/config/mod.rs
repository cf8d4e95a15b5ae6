//! Job configuration types.
//!
//! A [`JobConfig`] is immutable for the lifetime of a job: the orchestrator
//! never mutates it, and every worker receives a shared reference. Validation
//! happens once, up front, through [`JobConfig::validate`].

pub mod parallel;

pub use parallel::ParallelPolicy;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::ExtractError;

/// Which OCR stages a job is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStrategy {
    /// Only the local engine; gaps are reported, never recovered.
    LocalOnly,
    /// Local first, remote fallback for columns with gaps. The default.
    LocalThenRemote,
    /// Local only, with gaps left for manual review downstream.
    ManualFallback,
}

impl OcrStrategy {
    /// True when the remote engine may be invoked automatically.
    pub fn permits_remote(&self) -> bool {
        matches!(self, OcrStrategy::LocalThenRemote)
    }
}

impl std::str::FromStr for OcrStrategy {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_only" => Ok(OcrStrategy::LocalOnly),
            "local_then_remote" => Ok(OcrStrategy::LocalThenRemote),
            "manual_fallback" => Ok(OcrStrategy::ManualFallback),
            other => Err(ExtractError::config(format!(
                "unknown strategy '{other}'; expected local_only, local_then_remote or manual_fallback"
            ))),
        }
    }
}

/// Credentials for the remote coordinate-returning OCR service.
///
/// Treated as an opaque pair by the pipeline; only the remote engine reads
/// the fields. `Debug` is implemented by hand so keys never leak into logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteCredentials {
    pub app_id: String,
    pub app_key: String,
}

impl RemoteCredentials {
    /// Reads credentials from `REMOTE_OCR_APP_ID` / `REMOTE_OCR_APP_KEY`.
    pub fn from_env() -> Option<Self> {
        let app_id = std::env::var("REMOTE_OCR_APP_ID").ok()?;
        let app_key = std::env::var("REMOTE_OCR_APP_KEY").ok()?;
        if app_id.is_empty() || app_key.is_empty() {
            return None;
        }
        Some(Self { app_id, app_key })
    }

    /// Reads credentials from a JSON file `{"app_id": …, "app_key": …}`.
    ///
    /// A file, when given, overrides the environment.
    pub fn from_file(path: &Path) -> Result<Self, ExtractError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::config(format!(
                "cannot read credentials file '{}': {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ExtractError::config(format!(
                "malformed credentials file '{}': {e}",
                path.display()
            ))
        })
    }
}

impl std::fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("app_id", &self.app_id)
            .field("app_key", &"<redacted>")
            .finish()
    }
}

/// Encoding used for emitted problem images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

/// Immutable configuration for one extraction job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub strategy: OcrStrategy,
    /// Rasterization density in dots per inch.
    pub dpi: u32,
    /// Retry budget shared by OCR invocations within one column.
    pub max_retries: u32,
    /// Minimum confidence for markers from the local engine.
    pub min_local_confidence: f32,
    /// Minimum confidence for markers from the remote engine.
    pub min_remote_confidence: f32,
    /// Expected number of problems in the whole document, when known.
    pub expected_problem_count: Option<u32>,
    pub remote_credentials: Option<RemoteCredentials>,
    /// Wall-clock budget for the whole job.
    pub deadline: Option<Duration>,
    pub image_format: ImageFormat,
    pub parallel: ParallelPolicy,
    /// Per-call timeout for the local engine.
    pub local_timeout: Duration,
    /// Per-call timeout for the remote engine.
    pub remote_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            strategy: OcrStrategy::LocalThenRemote,
            dpi: 200,
            max_retries: 2,
            min_local_confidence: 0.5,
            min_remote_confidence: 0.7,
            expected_problem_count: None,
            remote_credentials: None,
            deadline: None,
            image_format: ImageFormat::Png,
            parallel: ParallelPolicy::default(),
            local_timeout: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(120),
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: OcrStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_expected_problem_count(mut self, count: Option<u32>) -> Self {
        self.expected_problem_count = count;
        self
    }

    pub fn with_remote_credentials(mut self, credentials: Option<RemoteCredentials>) -> Self {
        self.remote_credentials = credentials;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_image_format(mut self, format: ImageFormat) -> Self {
        self.image_format = format;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelPolicy) -> Self {
        self.parallel = parallel;
        self
    }

    /// Checks internal consistency once, before the job starts.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.dpi < 72 || self.dpi > 600 {
            return Err(ExtractError::config(format!(
                "dpi {} outside supported range 72..=600",
                self.dpi
            )));
        }
        for (name, value) in [
            ("min_local_confidence", self.min_local_confidence),
            ("min_remote_confidence", self.min_remote_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ExtractError::config(format!(
                    "{name} {value} outside [0, 1]"
                )));
            }
        }
        if let Some(count) = self.expected_problem_count {
            if count == 0 || count > crate::core::MAX_PROBLEM_NUMBER {
                return Err(ExtractError::config(format!(
                    "expected_problem_count {count} outside 1..={}",
                    crate::core::MAX_PROBLEM_NUMBER
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(JobConfig::default().validate().is_ok());
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "local_then_remote".parse::<OcrStrategy>().unwrap(),
            OcrStrategy::LocalThenRemote
        );
        assert!("remote_first".parse::<OcrStrategy>().is_err());
    }

    #[test]
    fn only_local_then_remote_permits_remote() {
        assert!(OcrStrategy::LocalThenRemote.permits_remote());
        assert!(!OcrStrategy::LocalOnly.permits_remote());
        assert!(!OcrStrategy::ManualFallback.permits_remote());
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let config = JobConfig::default().with_dpi(10);
        assert!(config.validate().is_err());

        let config = JobConfig::default().with_expected_problem_count(Some(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_debug_redacts_key() {
        let creds = RemoteCredentials {
            app_id: "id".into(),
            app_key: "secret".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret"));
    }
}
