//! OCR engines and marker parsing.
//!
//! The pipeline talks to OCR through the [`OcrEngine`] trait so the local
//! and remote recognizers are interchangeable. Every text block carries the
//! identifier of the engine that produced it, which lets a merged marker
//! list explain its provenance.

mod engine;
mod parser;
mod remote;
mod tesseract;
mod types;

pub use engine::OcrEngine;
pub use parser::{
    MarkerParser, ParsedColumn, ParserConfig, SharedSpan, parse_problem_number, parse_shared_span,
};
pub use remote::RemoteCoordEngine;
pub use tesseract::TesseractEngine;
pub use types::{EngineKind, LanguageHint, Marker, OcrResponse, TextBlock};
