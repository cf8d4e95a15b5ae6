//! exam-crop: extract individual exam problems from multi-column test-paper
//! PDFs as cropped images.
//!
//! The crate rasterizes a PDF, splits each page into reading columns,
//! locates problem-number markers with a cheap local OCR pass, validates
//! the detected numbers, and escalates columns with gaps to a remote
//! coordinate-returning OCR engine. Recovered coordinates are reconciled
//! into the local pixel space before boundaries are recomputed. The final
//! artifact is a directory of cropped problem images plus a manifest,
//! packaged as a ZIP archive.
//!
//! # Main APIs
//!
//! - [`pipeline::Extractor`] - runs one extraction job end to end
//! - [`core::JobConfig`] - per-job, immutable configuration
//! - [`ocr::OcrEngine`] - the recognizer contract, with local
//!   ([`ocr::TesseractEngine`]) and remote ([`ocr::RemoteCoordEngine`])
//!   implementations
//!
//! # Example
//!
//! ```no_run
//! use exam_crop::core::JobConfig;
//! use exam_crop::pipeline::Extractor;
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), exam_crop::core::ExtractError> {
//! let extractor = Extractor::new(JobConfig::default())?;
//! let report = extractor
//!     .run(Path::new("paper.pdf"), Path::new("out"))
//!     .await?;
//! println!("status: {:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod layout;
pub mod ocr;
pub mod output;
pub mod pdf;
pub mod pipeline;
pub mod utils;

pub use crate::core::{ExtractError, JobConfig, OcrStrategy};
pub use crate::output::{JobStatus, Manifest};
pub use crate::pipeline::{Extractor, JobReport};
