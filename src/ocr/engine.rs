//! The OCR engine contract.

use async_trait::async_trait;
use image::RgbImage;

use crate::core::OcrFailure;
use crate::ocr::types::{EngineKind, LanguageHint, OcrResponse};

/// Contract shared by all recognizers.
///
/// Implementations never raise on unrecognized content: a blank or
/// unreadable-but-valid image yields an empty block list. Errors are
/// reserved for the engine itself failing, classified through
/// [`OcrFailure`] so the orchestrator can apply its retry policy.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Cheap availability probe; used for diagnostics, not gating.
    async fn available(&self) -> bool;

    /// Runs recognition on one image.
    ///
    /// `dpi` describes the rasterization density of `image` so engines can
    /// tune their own preprocessing; it does not change the coordinate
    /// space of the response.
    async fn run(
        &self,
        image: &RgbImage,
        language_hints: &[LanguageHint],
        dpi: u32,
    ) -> Result<OcrResponse, OcrFailure>;
}
