//! Page layout analysis.
//!
//! Detects the column structure of a rasterized test-paper page and splits
//! the page into column strips in reading order (left to right).

mod detector;
mod strip;

pub use detector::{LayoutAnalyzer, LayoutConfig};
pub use strip::ColumnStrip;
