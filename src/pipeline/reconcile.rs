//! Coordinate reconciliation between OCR engines.
//!
//! The local engine reports in the input image's pixel grid; the remote
//! engine reports in whatever grid it rasterized internally. The two spaces
//! are never compared or merged implicitly: this module computes explicit
//! scale factors and maps remote blocks into strip space, asserting that
//! every mapped box lands inside the strip.

use tracing::warn;

use crate::core::{ExtractError, Rect};
use crate::ocr::TextBlock;

/// Horizontal and vertical scale from remote page space into strip space.
#[derive(Debug, Clone, Copy)]
pub struct ScaleFactors {
    pub s_x: f64,
    pub s_y: f64,
}

/// Maximum tolerated relative difference between the two axes' factors.
const ANISOTROPY_TOLERANCE: f64 = 0.05;

/// Computes scale factors, or `None` when the remote dimensions are unusable.
///
/// The factors are expected to be nearly equal; a larger spread usually
/// means the engine padded or cropped the page, so it is logged and the
/// factors are used as computed.
pub fn compute_scale(strip_dims: (u32, u32), remote_dims: (u32, u32)) -> Option<ScaleFactors> {
    let (strip_w, strip_h) = strip_dims;
    let (remote_w, remote_h) = remote_dims;
    if remote_w == 0 || remote_h == 0 || strip_w == 0 || strip_h == 0 {
        return None;
    }

    let factors = ScaleFactors {
        s_x: strip_w as f64 / remote_w as f64,
        s_y: strip_h as f64 / remote_h as f64,
    };

    let spread = (factors.s_x - factors.s_y).abs() / factors.s_x.max(factors.s_y);
    if spread > ANISOTROPY_TOLERANCE {
        warn!(
            target: "pipeline",
            s_x = factors.s_x,
            s_y = factors.s_y,
            spread,
            "anisotropic remote scale factors; proceeding"
        );
    }

    Some(factors)
}

/// Maps remote blocks into strip pixel space.
///
/// Blocks whose raw coordinates fall outside the remote engine's own page
/// dimensions are bad data and dropped with a warning. After scaling with
/// consistent factors the result must lie within the strip; a mapped block
/// escaping the strip indicates a reconciliation bug and is fatal.
pub fn reconcile_blocks(
    blocks: Vec<TextBlock>,
    remote_dims: (u32, u32),
    strip_dims: (u32, u32),
) -> Result<Vec<TextBlock>, ExtractError> {
    let Some(factors) = compute_scale(strip_dims, remote_dims) else {
        warn!(
            target: "pipeline",
            remote_w = remote_dims.0,
            remote_h = remote_dims.1,
            "unusable remote page dimensions; dropping remote blocks"
        );
        return Ok(Vec::new());
    };

    let (strip_w, strip_h) = strip_dims;
    let mut reconciled = Vec::with_capacity(blocks.len());

    for block in blocks {
        if !block.bbox.fits_within(remote_dims.0, remote_dims.1) {
            warn!(
                target: "pipeline",
                text = %block.text,
                "remote block outside the engine's reported page; dropping"
            );
            continue;
        }

        let scale_len = |v: u32, s: f64| ((v as f64 * s).round() as u32).max(1);
        let bbox = Rect::new(
            (block.bbox.x as f64 * factors.s_x).round() as u32,
            (block.bbox.y as f64 * factors.s_y).round() as u32,
            scale_len(block.bbox.w, factors.s_x),
            scale_len(block.bbox.h, factors.s_y),
        )?;

        let bbox = match bbox.clamped_to(strip_w, strip_h) {
            // Rounding may push an edge-touching box a pixel past the strip;
            // anything clamped further than that is a real containment bug.
            Some(clamped)
                if clamped.right() + 1 >= bbox.right() && clamped.bottom() + 1 >= bbox.bottom() =>
            {
                clamped
            }
            _ => {
                return Err(ExtractError::internal(format!(
                    "reconciled block '{}' escapes its strip: {:?} in {}x{}",
                    block.text, bbox, strip_w, strip_h
                )));
            }
        };

        reconciled.push(TextBlock { bbox, ..block });
    }

    Ok(reconciled)
}
