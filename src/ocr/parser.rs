//! Problem-number marker recognition.
//!
//! Turns raw OCR text blocks into typed [`Marker`]s. Recognized token
//! shapes, tried in order:
//!
//! 1. Digits followed by `.` or `,` at the start of the token (`3.`,
//!    `12,`, `8. 그림은`); the comma form is a frequent OCR misread of the
//!    dot.
//! 2. Circled digits `①`..`⑳`.
//! 3. Bracketed digits `[n]` or `(n)` as the whole token.
//!
//! Score markers like `[3점]` are never problem numbers. A range token
//! like `[8~9]` is not a plain number either: it announces a passage
//! shared by problems 8 and 9, so it anchors the first number and leaves
//! the rest to be found below it (see [`SharedSpan`]). Tokens that sit too
//! far from the column's left edge are rejected as well; answer-choice
//! digits inside body text would otherwise produce false markers.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::{
    JobConfig, MAX_MARKER_X_OFFSET, MAX_PROBLEM_NUMBER, MIN_PROBLEM_NUMBER, REFERENCE_DPI, Rect,
    SPAN_MEMBER_MIN_GAP, SPAN_MEMBER_WINDOW,
};
use crate::ocr::types::{EngineKind, Marker, TextBlock};

static LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3})[.,](?:\s|$)").expect("valid regex"));
static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[(\d{1,3})\]$").expect("valid regex"));
static PARENTHESIZED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\((\d{1,3})\)$").expect("valid regex"));
static RANGE_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\d{1,3})\s*[~\-_]\s*(\d{1,3})\]").expect("valid regex"));

/// Weakest OCR block accepted as a shared-passage member.
const SPAN_MEMBER_MIN_CONFIDENCE: f32 = 0.2;

/// Parses a problem number out of one token, ignoring gates.
///
/// Returns `None` for anything that is not a problem-number shape,
/// including score markers (`[1.5점]`, `[2점]`) and ranges (`[8~9]`).
pub fn parse_problem_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    // Score markers carry 점; ranges use ~ or -.
    if text.contains('점') || text.contains('~') || text.contains('-') {
        return None;
    }

    if let Some(caps) = LEADING_NUMBER.captures(text) {
        return caps[1].parse().ok();
    }

    let mut chars = text.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        let code = c as u32;
        if (0x2460..=0x2473).contains(&code) {
            return Some(code - 0x2460 + 1);
        }
    }

    for pattern in [&*BRACKETED, &*PARENTHESIZED] {
        if let Some(caps) = pattern.captures(text) {
            return caps[1].parse().ok();
        }
    }

    None
}

/// Parses a shared-passage range token like `[8~9]` (also seen OCR'd as
/// `[8-9]` or `[8_9]`), possibly followed by passage text.
///
/// Returns the inclusive number range the passage serves.
pub fn parse_shared_span(text: &str) -> Option<(u32, u32)> {
    let caps = RANGE_SPAN.captures(text.trim())?;
    let start: u32 = caps[1].parse().ok()?;
    let end: u32 = caps[2].parse().ok()?;
    (start <= end).then_some((start, end))
}

/// A shared passage serving the problems `start..=end`.
///
/// The bracket token anchors the first problem of the run; the remaining
/// numbers are expected further down the column, usually as bare digits
/// the strict marker grammar would reject.
#[derive(Debug, Clone)]
pub struct SharedSpan {
    pub start: u32,
    pub end: u32,
    /// Position of the range token in strip space.
    pub bbox: Rect,
    pub confidence: f32,
    pub source: EngineKind,
}

/// Markers plus shared-passage spans recognized in one column.
#[derive(Debug, Clone, Default)]
pub struct ParsedColumn {
    pub markers: Vec<Marker>,
    pub spans: Vec<SharedSpan>,
}

/// Gates applied on top of token recognition.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub min_number: u32,
    pub max_number: u32,
    /// Maximum distance from the column's left edge, in strip pixels.
    pub max_marker_x_offset: u32,
    pub min_confidence: f32,
}

impl ParserConfig {
    /// Gate settings for blocks from the local engine.
    pub fn for_local(config: &JobConfig) -> Self {
        Self {
            min_number: MIN_PROBLEM_NUMBER,
            max_number: MAX_PROBLEM_NUMBER,
            max_marker_x_offset: scaled_offset(config.dpi),
            min_confidence: config.min_local_confidence,
        }
    }

    /// Gate settings for reconciled blocks from the remote engine.
    pub fn for_remote(config: &JobConfig) -> Self {
        Self {
            min_confidence: config.min_remote_confidence,
            ..Self::for_local(config)
        }
    }

    /// Loosened gates for a second local pass over a column with gaps.
    pub fn relaxed(&self) -> Self {
        Self {
            min_number: self.min_number,
            max_number: self.max_number,
            max_marker_x_offset: self.max_marker_x_offset + 50,
            min_confidence: (self.min_confidence - 0.1).max(0.2),
        }
    }
}

/// The marker x-offset gate scales with rasterization density.
fn scaled_offset(dpi: u32) -> u32 {
    (MAX_MARKER_X_OFFSET as u64 * dpi as u64 / REFERENCE_DPI as u64) as u32
}

/// Extracts problem-number markers from one column's text blocks.
#[derive(Debug, Clone)]
pub struct MarkerParser {
    config: ParserConfig,
}

impl MarkerParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    /// Recognizes, gates, deduplicates, and sorts markers by ascending y.
    ///
    /// Duplicate numbers keep the higher-confidence occurrence; ties keep
    /// the one closer to the top of the column.
    pub fn parse(&self, blocks: &[TextBlock]) -> Vec<Marker> {
        self.parse_with_spans(blocks).markers
    }

    /// Like [`MarkerParser::parse`], additionally collecting shared-passage
    /// spans. A range token such as `[8~9]` yields a marker for its first
    /// number plus a span recording that the following numbers belong to
    /// the same passage run.
    pub fn parse_with_spans(&self, blocks: &[TextBlock]) -> ParsedColumn {
        let mut by_number: BTreeMap<u32, Marker> = BTreeMap::new();
        let mut by_range: BTreeMap<(u32, u32), SharedSpan> = BTreeMap::new();

        for block in blocks {
            if block.confidence < self.config.min_confidence {
                continue;
            }
            if block.bbox.x > self.config.max_marker_x_offset {
                continue;
            }

            let number = match parse_shared_span(&block.text) {
                Some((start, end))
                    if start >= self.config.min_number && end <= self.config.max_number =>
                {
                    let span = SharedSpan {
                        start,
                        end,
                        bbox: block.bbox,
                        confidence: block.confidence,
                        source: block.engine,
                    };
                    match by_range.get(&(start, end)) {
                        Some(existing) if existing.confidence >= span.confidence => {}
                        _ => {
                            by_range.insert((start, end), span);
                        }
                    }
                    start
                }
                Some(_) => continue,
                None => match parse_problem_number(&block.text) {
                    Some(n) if n >= self.config.min_number && n <= self.config.max_number => n,
                    _ => continue,
                },
            };

            let candidate = Marker {
                number,
                bbox: block.bbox,
                confidence: block.confidence,
                source: block.engine,
            };

            match by_number.get(&number) {
                Some(existing) if !prefer(&candidate, existing) => {}
                _ => {
                    by_number.insert(number, candidate);
                }
            }
        }

        let mut markers: Vec<Marker> = by_number.into_values().collect();
        markers.sort_by_key(|m| m.bbox.y);
        let mut spans: Vec<SharedSpan> = by_range.into_values().collect();
        spans.sort_by_key(|s| s.bbox.y);
        ParsedColumn { markers, spans }
    }

    /// Recovers follow-on numbers of shared passages.
    ///
    /// A passage `[8~9]` anchors problem 8; problem 9's own number usually
    /// appears further down as a bare digit that the strict grammar
    /// rejects. This searches the block pool in the window below each
    /// span's token for the first plausible sighting of every member not
    /// already found.
    pub fn recover_span_members(
        &self,
        spans: &[SharedSpan],
        blocks: &[TextBlock],
        found: &BTreeSet<u32>,
    ) -> Vec<Marker> {
        let mut recovered: Vec<Marker> = Vec::new();

        for span in spans {
            let window_top = span.bbox.y.saturating_add(SPAN_MEMBER_MIN_GAP);
            let window_bottom = span.bbox.y.saturating_add(SPAN_MEMBER_WINDOW);

            for target in (span.start + 1)..=span.end {
                if found.contains(&target) || recovered.iter().any(|m| m.number == target) {
                    continue;
                }

                let sighting = blocks
                    .iter()
                    .filter(|b| b.bbox.y > window_top && b.bbox.y < window_bottom)
                    .filter(|b| b.confidence >= SPAN_MEMBER_MIN_CONFIDENCE)
                    .filter(|b| b.bbox.x <= self.config.max_marker_x_offset)
                    .filter(|b| self.is_span_member(b, target))
                    .min_by_key(|b| b.bbox.y);

                if let Some(block) = sighting {
                    recovered.push(Marker {
                        number: target,
                        bbox: block.bbox,
                        confidence: block.confidence,
                        source: block.engine,
                    });
                }
            }
        }

        recovered
    }

    fn is_span_member(&self, block: &TextBlock, target: u32) -> bool {
        let text = block.text.trim();
        if parse_problem_number(text) == Some(target) {
            return true;
        }
        // A bare digit; only trusted because a passage announced the number.
        text == target.to_string()
    }
}

/// True when `candidate` should replace `existing` for the same number.
fn prefer(candidate: &Marker, existing: &Marker) -> bool {
    if candidate.confidence != existing.confidence {
        candidate.confidence > existing.confidence
    } else {
        candidate.bbox.y < existing.bbox.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rect;

    fn block(text: &str, x: u32, y: u32, confidence: f32) -> TextBlock {
        TextBlock {
            text: text.to_string(),
            bbox: Rect::new(x, y, 30, 24).unwrap(),
            confidence,
            engine: EngineKind::Local,
        }
    }

    #[test]
    fn recognizes_dot_and_comma_forms() {
        assert_eq!(parse_problem_number("3."), Some(3));
        assert_eq!(parse_problem_number("12,"), Some(12));
        assert_eq!(parse_problem_number("8. 그림은"), Some(8));
        assert_eq!(parse_problem_number("6, 다음"), Some(6));
    }

    #[test]
    fn recognizes_circled_and_bracketed_forms() {
        assert_eq!(parse_problem_number("①"), Some(1));
        assert_eq!(parse_problem_number("⑳"), Some(20));
        assert_eq!(parse_problem_number("[5]"), Some(5));
        assert_eq!(parse_problem_number("(7)"), Some(7));
    }

    #[test]
    fn rejects_score_and_range_markers() {
        assert_eq!(parse_problem_number("[3점]"), None);
        assert_eq!(parse_problem_number("[1.5점]"), None);
        assert_eq!(parse_problem_number("[8~9]"), None);
        assert_eq!(parse_problem_number("[8-9]"), None);
    }

    #[test]
    fn rejects_mid_text_and_plain_digits() {
        assert_eq!(parse_problem_number("문제 (3) 참고"), None);
        assert_eq!(parse_problem_number("42"), None);
        assert_eq!(parse_problem_number("3.5"), None);
    }

    fn test_parser() -> MarkerParser {
        MarkerParser::new(ParserConfig {
            min_number: 1,
            max_number: 100,
            max_marker_x_offset: 300,
            min_confidence: 0.5,
        })
    }

    #[test]
    fn position_gate_rejects_deep_tokens() {
        let markers = test_parser().parse(&[block("1.", 500, 100, 0.9)]);
        assert!(markers.is_empty());
    }

    #[test]
    fn confidence_gate_rejects_weak_tokens() {
        let markers = test_parser().parse(&[block("2.", 50, 100, 0.3)]);
        assert!(markers.is_empty());
    }

    #[test]
    fn duplicates_keep_higher_confidence_then_smaller_y() {
        let markers = test_parser().parse(&[
            block("4.", 40, 900, 0.8),
            block("4.", 40, 100, 0.6),
            block("5.", 40, 1400, 0.7),
            block("5.", 40, 1200, 0.7),
        ]);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].number, 4);
        assert_eq!(markers[0].bbox.y, 900);
        assert_eq!(markers[1].number, 5);
        assert_eq!(markers[1].bbox.y, 1200);
    }

    #[test]
    fn output_is_sorted_by_y() {
        let markers = test_parser().parse(&[
            block("2.", 40, 1200, 0.9),
            block("1.", 40, 100, 0.9),
        ]);
        assert_eq!(
            markers.iter().map(|m| m.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn relaxed_config_loosens_both_gates() {
        let base = ParserConfig {
            min_number: 1,
            max_number: 100,
            max_marker_x_offset: 300,
            min_confidence: 0.25,
        };
        let relaxed = base.relaxed();
        assert_eq!(relaxed.max_marker_x_offset, 350);
        assert!((relaxed.min_confidence - 0.2).abs() < 1e-6);
    }

    #[test]
    fn offset_scales_with_dpi() {
        assert_eq!(scaled_offset(200), 300);
        assert_eq!(scaled_offset(400), 600);
        assert_eq!(scaled_offset(100), 150);
    }

    #[test]
    fn shared_span_token_forms() {
        assert_eq!(parse_shared_span("[8~9]"), Some((8, 9)));
        assert_eq!(parse_shared_span("[8-9]"), Some((8, 9)));
        assert_eq!(parse_shared_span("[8_9]"), Some((8, 9)));
        assert_eq!(parse_shared_span("[8 ~ 9]"), Some((8, 9)));
        assert_eq!(parse_shared_span("[8~9] 다음 글을 읽고"), Some((8, 9)));
        assert_eq!(parse_shared_span("[9~8]"), None);
        assert_eq!(parse_shared_span("[3점]"), None);
        assert_eq!(parse_shared_span("8~9"), None);
    }

    #[test]
    fn range_token_anchors_its_first_number_and_records_a_span() {
        let parsed = test_parser().parse_with_spans(&[block("[8~9] 다음", 40, 200, 0.9)]);

        assert_eq!(parsed.markers.len(), 1);
        assert_eq!(parsed.markers[0].number, 8);
        assert_eq!(parsed.markers[0].bbox.y, 200);

        assert_eq!(parsed.spans.len(), 1);
        assert_eq!((parsed.spans[0].start, parsed.spans[0].end), (8, 9));
    }

    #[test]
    fn span_tokens_respect_position_and_confidence_gates() {
        let parsed = test_parser().parse_with_spans(&[
            block("[8~9]", 500, 200, 0.9),
            block("[3~4]", 40, 600, 0.3),
        ]);
        assert!(parsed.markers.is_empty());
        assert!(parsed.spans.is_empty());
    }

    #[test]
    fn span_members_are_recovered_from_bare_digits_below() {
        let parser = test_parser();
        let parsed = parser.parse_with_spans(&[block("[8~9]", 40, 200, 0.9)]);
        let blocks = vec![
            // Above the token: not a member.
            block("9", 40, 150, 0.8),
            // Inside the window: the member sighting.
            block("9", 40, 900, 0.8),
            // Too far from the left edge.
            block("9", 600, 1000, 0.9),
        ];

        let found: BTreeSet<u32> = parsed.markers.iter().map(|m| m.number).collect();
        let recovered = parser.recover_span_members(&parsed.spans, &blocks, &found);

        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].number, 9);
        assert_eq!(recovered[0].bbox.y, 900);
    }

    #[test]
    fn span_recovery_skips_numbers_already_found() {
        let parser = test_parser();
        let parsed = parser.parse_with_spans(&[
            block("[8~9]", 40, 200, 0.9),
            block("9.", 40, 900, 0.9),
        ]);
        let found: BTreeSet<u32> = parsed.markers.iter().map(|m| m.number).collect();
        assert!(found.contains(&9));

        let recovered =
            parser.recover_span_members(&parsed.spans, &[block("9", 40, 1100, 0.8)], &found);
        assert!(recovered.is_empty());
    }

    #[test]
    fn span_recovery_ignores_sightings_outside_the_window() {
        let parser = test_parser();
        let spans = vec![SharedSpan {
            start: 8,
            end: 9,
            bbox: Rect::new(40, 200, 60, 24).unwrap(),
            confidence: 0.9,
            source: EngineKind::Local,
        }];
        let blocks = vec![block("9", 40, 2500, 0.8)];
        let recovered = parser.recover_span_members(&spans, &blocks, &BTreeSet::new());
        assert!(recovered.is_empty());
    }
}
