//! Error types for the extraction pipeline.
//!
//! [`ExtractError`] is the top-level error for a job. OCR engines report
//! failures through the narrower [`OcrFailure`] type so the orchestrator can
//! decide between retrying, escalating to the remote engine, and giving up,
//! without inspecting error messages.

use thiserror::Error;

/// Failure classes an OCR engine may report.
///
/// The orchestrator maps these onto its retry policy: `Transient` failures
/// are retried with backoff, `Permanent` failures are not, and `Unavailable`
/// means the engine cannot run at all (missing binary, missing credentials).
#[derive(Debug, Error)]
pub enum OcrFailure {
    /// Worth retrying: timeouts, rate limits, connection resets.
    #[error("transient OCR failure: {0}")]
    Transient(String),

    /// The engine rejected the input or the credentials; retrying is useless.
    #[error("permanent OCR failure: {0}")]
    Permanent(String),

    /// The engine is not usable in this configuration.
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),
}

impl OcrFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, OcrFailure::Transient(_))
    }
}

/// Errors that can occur while running an extraction job.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The input PDF is unreadable or empty. Fatal at job start.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// The external rasterizer failed. Fatal for the job.
    #[error("rasterization failed: {message}")]
    RasterizeFailed { message: String },

    /// Local OCR failed permanently or exhausted its retry budget.
    #[error("OCR failed in {engine}: {message}")]
    OcrFailed { engine: String, message: String },

    /// The per-job deadline expired.
    #[error("deadline exceeded after {elapsed_ms} ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// An internal invariant was violated. Indicates a bug; never recovered.
    #[error("internal invariant violation: {message}")]
    Internal { message: String },

    /// Job configuration was rejected.
    #[error("configuration: {message}")]
    Config { message: String },

    #[error("image processing")]
    Image(#[from] image::ImageError),

    #[error("io")]
    Io(#[from] std::io::Error),

    #[error("archive")]
    Zip(#[from] zip::result::ZipError),
}

impl ExtractError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn rasterize(message: impl Into<String>) -> Self {
        Self::RasterizeFailed {
            message: message.into(),
        }
    }

    pub fn ocr_failed(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OcrFailed {
            engine: engine.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Machine-readable kind string used in the manifest's error entries.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::InvalidInput { .. } => "invalid_input",
            ExtractError::RasterizeFailed { .. } => "rasterize_failed",
            ExtractError::OcrFailed { .. } => "ocr_failed",
            ExtractError::DeadlineExceeded { .. } => "deadline_exceeded",
            ExtractError::Internal { .. } => "internal_assert",
            ExtractError::Config { .. } => "invalid_input",
            ExtractError::Image(_) => "internal_assert",
            ExtractError::Io(_) => "io",
            ExtractError::Zip(_) => "io",
        }
    }
}
