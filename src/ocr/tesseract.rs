//! Local OCR through the Tesseract command line tool.
//!
//! The engine shells out to `tesseract … tsv` and parses the tab-separated
//! word table. Bounding boxes come back in the input image's own pixel
//! space, so no reconciliation is needed for this engine.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use image::RgbImage;
use tokio::process::Command;
use tracing::debug;

use crate::core::{OcrFailure, Rect};
use crate::ocr::engine::OcrEngine;
use crate::ocr::types::{EngineKind, LanguageHint, OcrResponse, TextBlock};
use crate::utils::unique_temp_path;

/// Synchronous, no-network recognizer with moderate accuracy.
pub struct TesseractEngine {
    binary: PathBuf,
    /// Page segmentation mode; 3 is full automatic layout.
    psm: u8,
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            psm: 3,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn language_arg(hints: &[LanguageHint]) -> String {
        if hints.is_empty() {
            return "kor+eng".to_string();
        }
        hints
            .iter()
            .map(LanguageHint::tesseract_code)
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Local
    }

    async fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn run(
        &self,
        image: &RgbImage,
        language_hints: &[LanguageHint],
        dpi: u32,
    ) -> Result<OcrResponse, OcrFailure> {
        let started = Instant::now();
        let input_path = unique_temp_path("examcrop_ocr", "png");

        image
            .save(&input_path)
            .map_err(|e| OcrFailure::Transient(format!("cannot write OCR scratch image: {e}")))?;

        let output = Command::new(&self.binary)
            .arg(&input_path)
            .arg("stdout")
            .args(["-l", &Self::language_arg(language_hints)])
            .args(["--psm", &self.psm.to_string()])
            .args(["--dpi", &dpi.to_string()])
            .arg("tsv")
            .output()
            .await;

        let _ = std::fs::remove_file(&input_path);

        let output = output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OcrFailure::Unavailable(format!("tesseract binary not found: {e}"))
            } else {
                OcrFailure::Transient(format!("failed to spawn tesseract: {e}"))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrFailure::Permanent(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let blocks = parse_tsv(&stdout, image.dimensions());

        debug!(
            target: "ocr",
            engine = "local",
            blocks = blocks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "local OCR pass finished"
        );

        Ok(OcrResponse {
            blocks,
            engine: EngineKind::Local,
            page_dims: image.dimensions(),
            elapsed: started.elapsed(),
        })
    }
}

/// Parses Tesseract's `tsv` output into text blocks.
///
/// Columns: level, page_num, block_num, par_num, line_num, word_num,
/// left, top, width, height, conf, text. Rows with negative confidence are
/// layout nodes rather than recognized words and are skipped.
fn parse_tsv(tsv: &str, image_dims: (u32, u32)) -> Vec<TextBlock> {
    let (img_w, img_h) = image_dims;
    let mut blocks = Vec::new();

    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }

        let conf: f32 = match cols[10].parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        if conf < 0.0 {
            continue;
        }

        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }

        let parse_u32 = |s: &str| s.parse::<u32>().ok();
        let (Some(left), Some(top), Some(width), Some(height)) = (
            parse_u32(cols[6]),
            parse_u32(cols[7]),
            parse_u32(cols[8]),
            parse_u32(cols[9]),
        ) else {
            continue;
        };

        let Ok(bbox) = Rect::new(left, top, width, height) else {
            continue;
        };
        if !bbox.fits_within(img_w, img_h) {
            continue;
        }

        blocks.push(TextBlock {
            text: text.to_string(),
            bbox,
            confidence: (conf / 100.0).clamp(0.0, 1.0),
            engine: EngineKind::Local,
        });
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn parses_word_rows() {
        let tsv = format!(
            "{HEADER}\n5\t1\t1\t1\t1\t1\t120\t48\t30\t22\t96.5\t3.\n5\t1\t1\t1\t1\t2\t160\t48\t80\t22\t91.0\t다음은"
        );
        let blocks = parse_tsv(&tsv, (1000, 1000));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "3.");
        assert_eq!(blocks[0].bbox, Rect::new(120, 48, 30, 22).unwrap());
        assert!((blocks[0].confidence - 0.965).abs() < 1e-6);
        assert_eq!(blocks[0].engine, EngineKind::Local);
    }

    #[test]
    fn skips_layout_rows_and_empty_text() {
        let tsv = format!(
            "{HEADER}\n2\t1\t1\t0\t0\t0\t0\t0\t500\t500\t-1\t\n5\t1\t1\t1\t1\t1\t10\t10\t5\t5\t80\t "
        );
        assert!(parse_tsv(&tsv, (1000, 1000)).is_empty());
    }

    #[test]
    fn skips_boxes_outside_the_image() {
        let tsv = format!("{HEADER}\n5\t1\t1\t1\t1\t1\t990\t10\t30\t20\t90\tx");
        assert!(parse_tsv(&tsv, (1000, 1000)).is_empty());
    }

    #[test]
    fn language_arg_joins_hints() {
        assert_eq!(
            TesseractEngine::language_arg(&LanguageHint::defaults()),
            "kor+eng"
        );
        assert_eq!(TesseractEngine::language_arg(&[]), "kor+eng");
    }
}
