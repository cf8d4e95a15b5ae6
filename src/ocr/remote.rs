//! Remote coordinate-returning OCR engine.
//!
//! Talks to a Mathpix-style text API: the column image is uploaded as a
//! base64 data URI and the response carries line records with bounding
//! boxes in the service's own page space. The service may rasterize at a
//! different resolution than the input, so `page_dims` in the response is
//! authoritative for the coordinate space and the caller must reconcile.

use std::io::Cursor;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use image::RgbImage;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{OcrFailure, Rect, RemoteCredentials};
use crate::ocr::engine::OcrEngine;
use crate::ocr::types::{EngineKind, LanguageHint, OcrResponse, TextBlock};

const DEFAULT_BASE_URL: &str = "https://api.mathpix.com/v3";

/// Confidence assigned to lines the service reports without a score.
const DEFAULT_LINE_CONFIDENCE: f32 = 0.95;

/// Network-bound, higher-accuracy recognizer.
pub struct RemoteCoordEngine {
    client: reqwest::Client,
    credentials: Option<RemoteCredentials>,
    base_url: String,
}

impl RemoteCoordEngine {
    pub fn new(credentials: Option<RemoteCredentials>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Points the engine at a different endpoint (self-hosted or test).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn encode_png(image: &RgbImage) -> Result<String, OcrFailure> {
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .map_err(|e| OcrFailure::Permanent(format!("cannot encode upload image: {e}")))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(buffer.into_inner()))
    }
}

#[derive(Serialize)]
struct RecognizeRequest {
    src: String,
    formats: Vec<&'static str>,
    include_line_data: bool,
    ocr_languages: Vec<String>,
}

/// Wire shape of the service response; unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    page_width: Option<u32>,
    #[serde(default)]
    page_height: Option<u32>,
    #[serde(default)]
    lines: Vec<LineRecord>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineRecord {
    #[serde(default)]
    text: String,
    region: RegionRecord,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RegionRecord {
    top_left_x: f64,
    top_left_y: f64,
    width: f64,
    height: f64,
}

/// Converts the wire response into blocks in the service's page space.
fn blocks_from_response(
    response: RecognizeResponse,
    fallback_dims: (u32, u32),
) -> ((u32, u32), Vec<TextBlock>) {
    let page_dims = match (response.page_width, response.page_height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => fallback_dims,
    };

    let blocks = response
        .lines
        .into_iter()
        .filter_map(|line| {
            let text = line.text.trim().to_string();
            if text.is_empty() {
                return None;
            }
            let region = line.region;
            let bbox = Rect::new(
                region.top_left_x.max(0.0).round() as u32,
                region.top_left_y.max(0.0).round() as u32,
                region.width.round() as u32,
                region.height.round() as u32,
            )
            .ok()?;
            Some(TextBlock {
                text,
                bbox,
                confidence: line
                    .confidence
                    .unwrap_or(DEFAULT_LINE_CONFIDENCE)
                    .clamp(0.0, 1.0),
                engine: EngineKind::Remote,
            })
        })
        .collect();

    (page_dims, blocks)
}

fn classify_status(status: StatusCode, body: &str) -> OcrFailure {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        OcrFailure::Permanent(format!("remote OCR rejected credentials: {status}"))
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        OcrFailure::Transient(format!("remote OCR returned {status}: {body}"))
    } else {
        OcrFailure::Permanent(format!("remote OCR returned {status}: {body}"))
    }
}

#[async_trait]
impl OcrEngine for RemoteCoordEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Remote
    }

    async fn available(&self) -> bool {
        self.credentials.is_some()
    }

    async fn run(
        &self,
        image: &RgbImage,
        language_hints: &[LanguageHint],
        _dpi: u32,
    ) -> Result<OcrResponse, OcrFailure> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            OcrFailure::Unavailable("remote OCR credentials not configured".to_string())
        })?;

        let started = Instant::now();
        let encoded = Self::encode_png(image)?;
        let request = RecognizeRequest {
            src: format!("data:image/png;base64,{encoded}"),
            formats: vec!["data"],
            include_line_data: true,
            ocr_languages: language_hints
                .iter()
                .map(|h| h.iso_code().to_string())
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/text", self.base_url))
            .header("app_id", &credentials.app_id)
            .header("app_key", &credentials.app_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| OcrFailure::Transient(format!("remote OCR request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body.trim()));
        }

        let wire: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| OcrFailure::Transient(format!("malformed remote OCR response: {e}")))?;

        if let Some(message) = wire.error {
            return Err(OcrFailure::Permanent(format!(
                "remote OCR reported an error: {message}"
            )));
        }

        let (page_dims, blocks) = blocks_from_response(wire, image.dimensions());

        debug!(
            target: "ocr",
            engine = "remote",
            blocks = blocks.len(),
            page_width = page_dims.0,
            page_height = page_dims.1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote OCR pass finished"
        );

        Ok(OcrResponse {
            blocks,
            engine: EngineKind::Remote,
            page_dims,
            elapsed: started.elapsed(),
        })
    }
}
