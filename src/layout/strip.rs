//! Column strips cut from a page image.

use image::RgbImage;

use crate::core::Rect;
use crate::utils::slice_image;

/// One reading column of a page.
///
/// Strips on a page have strictly ascending x, never overlap, and always
/// span the full page height. `image` owns a copy of the strip's pixels so
/// columns can be processed independently of the page image's lifetime.
#[derive(Debug, Clone)]
pub struct ColumnStrip {
    /// Page index within the job, starting at 0.
    pub page: usize,
    /// Column index within the page, starting at 0 on the left.
    pub column: usize,
    /// Position of the strip within the page image.
    pub bounds: Rect,
    pub image: RgbImage,
}

impl ColumnStrip {
    pub fn width(&self) -> u32 {
        self.bounds.w
    }

    pub fn height(&self) -> u32 {
        self.bounds.h
    }

    /// Cuts strips out of a page image from `(left, right)` x-ranges.
    ///
    /// Ranges that collapse to nothing after clamping are skipped; column
    /// indices are assigned after skipping so they stay contiguous.
    pub fn cut(page_image: &RgbImage, page: usize, x_ranges: &[(u32, u32)]) -> Vec<ColumnStrip> {
        let (width, height) = page_image.dimensions();
        let mut strips = Vec::with_capacity(x_ranges.len());

        for &(left, right) in x_ranges {
            let left = left.min(width);
            let right = right.min(width);
            if left >= right {
                continue;
            }
            let bounds = match Rect::new(left, 0, right - left, height) {
                Ok(rect) => rect,
                Err(_) => continue,
            };
            let image = slice_image(page_image, &bounds);
            strips.push(ColumnStrip {
                page,
                column: strips.len(),
                bounds,
                image,
            });
        }

        strips
    }
}
