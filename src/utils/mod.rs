//! Utility functions shared across the pipeline.
//!
//! Image helpers, scratch-file naming, and logging setup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use image::{GrayImage, RgbImage, imageops};

use crate::core::Rect;

/// Initializes the global tracing subscriber.
///
/// Filtering is controlled through `RUST_LOG`. Call once at startup;
/// subsequent calls would panic, so the binary owns this.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Converts an RGB image to 8-bit grayscale.
pub fn rgb_to_grayscale(image: &RgbImage) -> GrayImage {
    imageops::grayscale(image)
}

/// Copies the rectangular region out of an image.
///
/// The rectangle must already fit within the image; callers clamp first.
pub fn slice_image(image: &RgbImage, rect: &Rect) -> RgbImage {
    imageops::crop_imm(image, rect.x, rect.y, rect.w, rect.h).to_image()
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a process-unique path in the system temp directory.
pub fn unique_temp_path(prefix: &str, extension: &str) -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "{prefix}_{}_{n}.{extension}",
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn slice_copies_expected_region() {
        let mut img = RgbImage::new(10, 10);
        img.put_pixel(3, 4, Rgb([7, 8, 9]));
        let rect = Rect::new(3, 4, 2, 2).unwrap();
        let sliced = slice_image(&img, &rect);
        assert_eq!(sliced.dimensions(), (2, 2));
        assert_eq!(sliced.get_pixel(0, 0), &Rgb([7, 8, 9]));
    }

    #[test]
    fn temp_paths_are_unique() {
        let a = unique_temp_path("x", "png");
        let b = unique_temp_path("x", "png");
        assert_ne!(a, b);
    }
}
