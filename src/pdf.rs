//! PDF rasterization through PDFium.
//!
//! Contract: given a PDF path and a DPI, yield one RGB image per page.
//! Everything downstream works on those images; no other PDF state leaks
//! into the pipeline.

use image::RgbImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::info;

use crate::core::ExtractError;

/// Directories probed for a PDFium shared library before falling back to
/// the system loader.
const LIBRARY_SEARCH_DIRS: &[&str] = &["./", "/usr/lib", "/usr/local/lib", "/opt/homebrew/lib"];

/// Neither side of a rendered page may exceed this many pixels.
const MAX_RENDER_EDGE: u32 = 8000;

fn bind_pdfium() -> Result<Box<dyn PdfiumLibraryBindings>, ExtractError> {
    for dir in LIBRARY_SEARCH_DIRS {
        let name = Pdfium::pdfium_platform_library_name_at_path(dir);
        if let Ok(bindings) = Pdfium::bind_to_library(name) {
            return Ok(bindings);
        }
    }
    Pdfium::bind_to_system_library()
        .map_err(|e| ExtractError::rasterize(format!("could not find PDFium library: {e}")))
}

/// Renders PDF pages to RGB images at a fixed DPI.
pub struct PdfRasterizer {
    pdfium: Pdfium,
    dpi: u32,
}

impl PdfRasterizer {
    pub fn new(dpi: u32) -> Result<Self, ExtractError> {
        Ok(Self {
            pdfium: Pdfium::new(bind_pdfium()?),
            dpi,
        })
    }

    /// Renders every page of the document.
    pub fn rasterize(&self, path: &Path) -> Result<Vec<RgbImage>, ExtractError> {
        let document = self
            .pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| ExtractError::invalid_input(format!("cannot open PDF: {e}")))?;

        if document.pages().len() == 0 {
            return Err(ExtractError::invalid_input("PDF has no pages"));
        }

        let images: Vec<RgbImage> = document
            .pages()
            .iter()
            .enumerate()
            .map(|(index, page)| {
                self.render_page(&page).map_err(|e| {
                    ExtractError::rasterize(format!("failed to render page {}: {e}", index + 1))
                })
            })
            .collect::<Result<_, _>>()?;

        info!(
            target: "pdf",
            pages = images.len(),
            dpi = self.dpi,
            "PDF rasterized"
        );
        Ok(images)
    }

    fn render_page(&self, page: &PdfPage) -> Result<RgbImage, PdfiumError> {
        let (target_w, target_h) =
            render_size(self.dpi, page.width().value, page.height().value);
        let config = PdfRenderConfig::new()
            .set_target_width(target_w as i32)
            .set_target_height(target_h as i32);
        Ok(page.render_with_config(&config)?.as_image().to_rgb8())
    }
}

/// Render size for a page given in PDF user-space units (1/72 inch),
/// shrunk uniformly when the requested DPI would exceed the edge cap.
fn render_size(dpi: u32, width_pt: f32, height_pt: f32) -> (u32, u32) {
    let px_per_point = dpi as f32 / 72.0;
    let full_w = width_pt * px_per_point;
    let full_h = height_pt * px_per_point;
    let shrink = (MAX_RENDER_EDGE as f32 / full_w.max(full_h)).min(1.0);
    (
        ((full_w * shrink) as u32).max(1),
        ((full_h * shrink) as u32).max(1),
    )
}

/// True when the path carries a `.pdf` extension, case-insensitive.
pub fn is_pdf_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_extension_detection() {
        assert!(is_pdf_path(Path::new("paper.pdf")));
        assert!(is_pdf_path(Path::new("PAPER.PDF")));
        assert!(!is_pdf_path(Path::new("paper.png")));
        assert!(!is_pdf_path(Path::new("paper")));
    }

    #[test]
    fn render_size_follows_dpi() {
        // A4 is 595x842 points; at 200 DPI that is 1652x2338 pixels.
        assert_eq!(render_size(200, 595.0, 842.0), (1652, 2338));
    }

    #[test]
    fn render_size_is_capped_uniformly() {
        let (w, h) = render_size(600, 595.0, 4000.0);
        assert!(w.max(h) <= MAX_RENDER_EDGE);
        // Aspect ratio survives the shrink.
        let ratio = h as f32 / w as f32;
        assert!((ratio - 4000.0 / 595.0).abs() < 0.05);
    }

    #[test]
    fn tiny_pages_still_render_at_least_one_pixel() {
        let (w, h) = render_size(72, 0.5, 0.5);
        assert_eq!((w, h), (1, 1));
    }
}
