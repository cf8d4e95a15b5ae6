//! Problem boundary computation within one column strip.
//!
//! A problem's region runs from its own marker down to the next marker, or
//! to the bottom of the strip for the last problem. The region always spans
//! the full column width; narrowing it risks clipping answer choices that
//! extend across the column.

use tracing::warn;

use crate::core::{ExtractError, Rect};
use crate::ocr::Marker;

/// Final computed region of one problem inside a column strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    pub number: u32,
    pub rect: Rect,
}

/// Computes per-problem rectangles from markers sorted by ascending y.
///
/// The last marker's region extends to the strip bottom; a content gap
/// below the final problem must not truncate it. Marker pairs that collapse
/// to a zero-height region are skipped.
pub fn solve_boundaries(
    markers: &[Marker],
    strip_width: u32,
    strip_height: u32,
) -> Vec<Boundary> {
    if strip_width == 0 || strip_height == 0 {
        return Vec::new();
    }

    let mut boundaries = Vec::with_capacity(markers.len());

    for (i, marker) in markers.iter().enumerate() {
        let y_top = marker.bbox.y;
        if y_top >= strip_height {
            warn!(
                target: "pipeline",
                number = marker.number,
                y = y_top,
                strip_height,
                "marker below strip bottom; skipping"
            );
            continue;
        }

        let y_bottom = match markers.get(i + 1) {
            Some(next) => next.bbox.y.min(strip_height),
            None => strip_height,
        };
        if y_bottom <= y_top {
            warn!(
                target: "pipeline",
                number = marker.number,
                y_top,
                y_bottom,
                "degenerate problem region; skipping"
            );
            continue;
        }

        match Rect::new(0, y_top, strip_width, y_bottom - y_top) {
            Ok(rect) => boundaries.push(Boundary {
                number: marker.number,
                rect,
            }),
            Err(_) => continue,
        }
    }

    boundaries
}

/// Asserts the solver's output invariants.
///
/// Violations indicate a bug in the solver or its inputs and are fatal;
/// they are never silently papered over.
pub fn verify_boundaries(
    boundaries: &[Boundary],
    strip_width: u32,
    strip_height: u32,
) -> Result<(), ExtractError> {
    for boundary in boundaries {
        if !boundary.rect.fits_within(strip_width, strip_height) {
            return Err(ExtractError::internal(format!(
                "boundary for problem {} exceeds its strip",
                boundary.number
            )));
        }
    }
    for pair in boundaries.windows(2) {
        if pair[0].rect.y_overlaps(&pair[1].rect) {
            return Err(ExtractError::internal(format!(
                "boundaries for problems {} and {} overlap",
                pair[0].number, pair[1].number
            )));
        }
    }
    Ok(())
}
