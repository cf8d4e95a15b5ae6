//! Cropping problem regions out of column strips.

use image::RgbImage;

use crate::core::{ExtractError, Rect};
use crate::utils::slice_image;

/// File name for one emitted problem image.
///
/// The number is zero-padded to two digits so lexical and numeric order
/// agree in archive listings.
pub fn problem_file_name(page: usize, column: usize, number: u32, extension: &str) -> String {
    format!("page{page}_col_{column}_prob_{number:02}.{extension}")
}

/// Crops one problem region from its strip image.
///
/// The rectangle must already lie within the strip; the boundary solver
/// guarantees this, so an out-of-range rectangle here is an internal error.
pub fn crop_problem(strip_image: &RgbImage, rect: &Rect) -> Result<RgbImage, ExtractError> {
    let (width, height) = strip_image.dimensions();
    if !rect.fits_within(width, height) {
        return Err(ExtractError::internal(format!(
            "crop rectangle {rect:?} exceeds strip {width}x{height}"
        )));
    }
    Ok(slice_image(strip_image, rect))
}
