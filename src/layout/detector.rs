//! Column detection on rasterized pages.
//!
//! Two detection paths, tried in order:
//!
//! 1. **Separator lines.** Edge detection followed by a Hough transform,
//!    keeping long near-vertical segments. Nearby candidates are merged so a
//!    thick ruled separator drawn as two edges collapses into one line.
//! 2. **Content gaps.** A smoothed vertical projection of dark pixels;
//!    wide low-content valleys in the page interior become boundaries.
//!
//! After splitting, strips narrower than the content minimum are dropped
//! (a surviving thick separator would otherwise appear as a spurious narrow
//! column) and the column count is capped at three.
//!
//! Detection never fails: a page where nothing is found yields one strip
//! covering the whole page.

use image::{GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::hough::{LineDetectionOptions, PolarLine, detect_lines};
use tracing::debug;

use crate::core::{GAP_THRESHOLD, MAX_COLUMNS, MERGE_TOLERANCE, MIN_COLUMN_WIDTH};
use crate::layout::ColumnStrip;
use crate::utils::rgb_to_grayscale;

/// Tunables for layout detection. Defaults are calibrated for 200 DPI scans.
#[derive(Debug, Clone)]
pub struct LayoutConfig {
    /// Vertical line candidates closer than this merge into one separator.
    pub merge_tolerance: u32,
    /// Minimum width of a low-content valley treated as a column gap.
    pub gap_threshold: u32,
    /// Minimum strip width to count as a content column.
    pub min_column_width: u32,
    /// A separator must span at least this fraction of the page height.
    pub min_line_span_ratio: f32,
    /// Degrees a line may deviate from vertical and still count.
    pub vertical_angle_tolerance: u32,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            merge_tolerance: MERGE_TOLERANCE,
            gap_threshold: GAP_THRESHOLD,
            min_column_width: MIN_COLUMN_WIDTH,
            min_line_span_ratio: 0.3,
            vertical_angle_tolerance: 2,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

/// Splits page images into column strips in reading order.
#[derive(Debug, Clone, Default)]
pub struct LayoutAnalyzer {
    config: LayoutConfig,
}

impl LayoutAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LayoutConfig) -> Self {
        Self { config }
    }

    /// Yields column strips for one page, sorted by ascending x.
    pub fn analyze(&self, page_image: &RgbImage, page: usize) -> Vec<ColumnStrip> {
        let (width, height) = page_image.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let gray = rgb_to_grayscale(page_image);

        let separators = self.detect_separators(&gray);
        let separators = if separators.is_empty() {
            self.detect_content_gaps(&gray)
        } else {
            separators
        };

        let ranges = self.ranges_from_separators(width, &separators);
        let ranges = self.filter_and_cap(width, ranges);

        debug!(
            target: "layout",
            page,
            columns = ranges.len(),
            separators = separators.len(),
            "page layout resolved"
        );

        ColumnStrip::cut(page_image, page, &ranges)
    }

    /// Merged x-positions of long vertical separator lines in the interior band.
    fn detect_separators(&self, gray: &GrayImage) -> Vec<u32> {
        let (width, height) = gray.dimensions();
        let edges = canny(gray, self.config.canny_low, self.config.canny_high);

        let min_span = (height as f32 * self.config.min_line_span_ratio) as u32;
        let options = LineDetectionOptions {
            vote_threshold: min_span.max(1),
            suppression_radius: self.config.merge_tolerance.max(1),
        };

        let mut candidates: Vec<u32> = detect_lines(&edges, options)
            .into_iter()
            .filter_map(|line| self.vertical_line_x(&line, width))
            .filter(|&x| Self::column_edge_span(&edges, x) >= min_span)
            .collect();
        candidates.sort_unstable();

        let merged = merge_nearby(&candidates, self.config.merge_tolerance);
        self.keep_interior(width, merged)
    }

    /// Maps a polar line to an x-position when it is close enough to vertical.
    fn vertical_line_x(&self, line: &PolarLine, width: u32) -> Option<u32> {
        let tolerance = self.config.vertical_angle_tolerance;
        let x = if line.angle_in_degrees <= tolerance {
            line.r
        } else if line.angle_in_degrees >= 180 - tolerance {
            -line.r
        } else {
            return None;
        };
        if x < 0.0 || x >= width as f32 {
            return None;
        }
        Some(x.round() as u32)
    }

    /// Number of rows containing an edge pixel in the 3-px band around `x`.
    fn column_edge_span(edges: &GrayImage, x: u32) -> u32 {
        let (width, height) = edges.dimensions();
        let lo = x.saturating_sub(1);
        let hi = (x + 1).min(width.saturating_sub(1));

        let mut span = 0;
        for y in 0..height {
            if (lo..=hi).any(|cx| edges.get_pixel(cx, y).0[0] > 0) {
                span += 1;
            }
        }
        span
    }

    /// Fallback: centers of wide low-content valleys in the projection.
    fn detect_content_gaps(&self, gray: &GrayImage) -> Vec<u32> {
        let (width, _) = gray.dimensions();
        let projection = dark_pixel_projection(gray);
        let smoothed = smooth(&projection, (width / 100).max(3) as usize | 1);

        let peak = smoothed.iter().cloned().fold(0.0f32, f32::max);
        if peak == 0.0 {
            return Vec::new();
        }

        let gaps = gap_centers(&smoothed, peak * 0.2, self.config.gap_threshold);
        self.keep_interior(width, gaps)
    }

    fn keep_interior(&self, width: u32, xs: Vec<u32>) -> Vec<u32> {
        let lo = width / 5;
        let hi = width * 4 / 5;
        xs.into_iter().filter(|&x| x >= lo && x <= hi).collect()
    }

    fn ranges_from_separators(&self, width: u32, separators: &[u32]) -> Vec<(u32, u32)> {
        if separators.is_empty() {
            return vec![(0, width)];
        }
        let mut cuts = Vec::with_capacity(separators.len() + 2);
        cuts.push(0);
        cuts.extend_from_slice(separators);
        cuts.push(width);
        cuts.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// Drops separator-width strips and caps the column count.
    fn filter_and_cap(&self, width: u32, ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
        let min_width = self.config.min_column_width.max(width / 10);

        let mut kept: Vec<(u32, u32)> = ranges
            .iter()
            .copied()
            .filter(|(l, r)| r - l >= min_width)
            .collect();

        if kept.is_empty() {
            // Everything was narrow; fall back to the full page.
            return vec![(0, width)];
        }

        while kept.len() > MAX_COLUMNS {
            let narrowest = kept
                .iter()
                .enumerate()
                .min_by_key(|(_, (l, r))| r - l)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let neighbor = if narrowest == 0 { 1 } else { narrowest - 1 };
            let (a, b) = (kept[narrowest.min(neighbor)], kept[narrowest.max(neighbor)]);
            kept[narrowest.min(neighbor)] = (a.0, b.1);
            kept.remove(narrowest.max(neighbor));
        }

        kept
    }
}

/// Merges sorted x-positions whose pairwise distance stays within `tolerance`.
///
/// Each cluster collapses to its mean, so a thick rule drawn as two edges
/// becomes a single separator between them.
fn merge_nearby(sorted_xs: &[u32], tolerance: u32) -> Vec<u32> {
    let mut merged = Vec::new();
    let mut cluster: Vec<u32> = Vec::new();

    for &x in sorted_xs {
        match cluster.last() {
            Some(&last) if x - last <= tolerance => cluster.push(x),
            Some(_) => {
                merged.push(mean(&cluster));
                cluster.clear();
                cluster.push(x);
            }
            None => cluster.push(x),
        }
    }
    if !cluster.is_empty() {
        merged.push(mean(&cluster));
    }
    merged
}

fn mean(xs: &[u32]) -> u32 {
    (xs.iter().map(|&x| x as u64).sum::<u64>() / xs.len() as u64) as u32
}

/// Count of dark pixels per image column, with the threshold chosen by Otsu.
fn dark_pixel_projection(gray: &GrayImage) -> Vec<f32> {
    let (width, height) = gray.dimensions();
    let level = imageproc::contrast::otsu_level(gray);

    let mut projection = vec![0.0f32; width as usize];
    for y in 0..height {
        for x in 0..width {
            if gray.get_pixel(x, y).0[0] < level {
                projection[x as usize] += 1.0;
            }
        }
    }
    projection
}

/// Moving-average smoothing with an odd window.
fn smooth(values: &[f32], window: usize) -> Vec<f32> {
    if values.is_empty() || window <= 1 {
        return values.to_vec();
    }
    let half = window / 2;
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(values.len());
        let sum: f32 = values[lo..hi].iter().sum();
        out.push(sum / (hi - lo) as f32);
    }
    out
}

/// Centers of runs where the projection stays below `threshold` for at least
/// `min_width` consecutive columns.
fn gap_centers(projection: &[f32], threshold: f32, min_width: u32) -> Vec<u32> {
    let mut centers = Vec::new();
    let mut run_start: Option<usize> = None;

    for (i, &value) in projection.iter().enumerate() {
        if value < threshold {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            if (i - start) as u32 >= min_width {
                centers.push(((start + i) / 2) as u32);
            }
        }
    }
    if let Some(start) = run_start {
        let end = projection.len();
        if (end - start) as u32 >= min_width {
            centers.push(((start + end) / 2) as u32);
        }
    }
    centers
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn thick_separator_merges_to_single_line() {
        // A 20 px rule scanned as two edges must not become its own column.
        let merged = merge_nearby(&[275, 295], 20);
        assert_eq!(merged, vec![285]);
    }

    #[test]
    fn distant_lines_stay_separate() {
        let merged = merge_nearby(&[300, 900], 20);
        assert_eq!(merged, vec![300, 900]);
    }

    #[test]
    fn ranges_split_at_separator() {
        let analyzer = LayoutAnalyzer::new();
        let ranges = analyzer.ranges_from_separators(2339, &[1169]);
        assert_eq!(ranges, vec![(0, 1169), (1169, 2339)]);
    }

    #[test]
    fn narrow_strip_is_dropped() {
        let analyzer = LayoutAnalyzer::new();
        let ranges = analyzer.filter_and_cap(2000, vec![(0, 900), (900, 950), (950, 2000)]);
        assert_eq!(ranges, vec![(0, 900), (950, 2000)]);
    }

    #[test]
    fn all_narrow_falls_back_to_full_page() {
        let analyzer = LayoutAnalyzer::new();
        let ranges = analyzer.filter_and_cap(300, vec![(0, 20), (20, 50)]);
        assert_eq!(ranges, vec![(0, 300)]);
    }

    #[test]
    fn column_count_is_capped() {
        let analyzer = LayoutAnalyzer::new();
        let ranges = analyzer.filter_and_cap(
            4000,
            vec![(0, 1000), (1000, 1500), (1500, 2500), (2500, 4000)],
        );
        assert_eq!(ranges.len(), 3);
        // Full horizontal coverage survives merging.
        assert_eq!(ranges.first().unwrap().0, 0);
        assert_eq!(ranges.last().unwrap().1, 4000);
    }

    #[test]
    fn blank_page_yields_single_full_strip() {
        let mut page = RgbImage::new(400, 600);
        for pixel in page.pixels_mut() {
            *pixel = Rgb([255, 255, 255]);
        }
        let strips = LayoutAnalyzer::new().analyze(&page, 0);
        assert_eq!(strips.len(), 1);
        assert_eq!(strips[0].bounds.w, 400);
        assert_eq!(strips[0].bounds.h, 600);
    }

    #[test]
    fn gap_centers_require_minimum_width() {
        let mut projection = vec![10.0f32; 300];
        for v in projection.iter_mut().take(200).skip(140) {
            *v = 0.0;
        }
        let centers = gap_centers(&projection, 1.0, 50);
        assert_eq!(centers, vec![170]);
        assert!(gap_centers(&projection, 1.0, 80).is_empty());
    }
}
