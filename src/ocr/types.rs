//! Data types exchanged with OCR engines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Rect;

/// Identifies which recognizer produced a block or marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The fast local engine; bounding boxes are in input-image pixel space.
    Local,
    /// The accurate remote engine; boxes are in the engine's own page space
    /// until reconciled.
    Remote,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Local => write!(f, "local"),
            EngineKind::Remote => write!(f, "remote"),
        }
    }
}

/// Recognition language hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageHint {
    Korean,
    English,
}

impl LanguageHint {
    /// Default hint set for Korean test papers.
    pub fn defaults() -> Vec<LanguageHint> {
        vec![LanguageHint::Korean, LanguageHint::English]
    }

    /// Tesseract traineddata name.
    pub fn tesseract_code(&self) -> &'static str {
        match self {
            LanguageHint::Korean => "kor",
            LanguageHint::English => "eng",
        }
    }

    /// ISO 639-1 code used by the remote API.
    pub fn iso_code(&self) -> &'static str {
        match self {
            LanguageHint::Korean => "ko",
            LanguageHint::English => "en",
        }
    }
}

/// One OCR output atom: a piece of text with its position and confidence.
#[derive(Debug, Clone)]
pub struct TextBlock {
    pub text: String,
    /// Position in the producing engine's pixel space.
    pub bbox: Rect,
    /// Normalized to `[0, 1]` regardless of the engine's native scale.
    pub confidence: f32,
    pub engine: EngineKind,
}

/// Full response of one OCR invocation.
#[derive(Debug, Clone)]
pub struct OcrResponse {
    pub blocks: Vec<TextBlock>,
    pub engine: EngineKind,
    /// Dimensions of the pixel space the blocks are reported in. May differ
    /// from the input image when the engine rasterizes internally.
    pub page_dims: (u32, u32),
    pub elapsed: Duration,
}

/// A recognized problem-number token with its position in strip space.
#[derive(Debug, Clone)]
pub struct Marker {
    pub number: u32,
    pub bbox: Rect,
    pub confidence: f32,
    pub source: EngineKind,
}
