//! # Result Normalizer
//!
//! Turns any [`TranscriptionResult`] shape into the single string that is
//! handed to the presentation boundary. Segments keep their original order and
//! are never merged.

use crate::transcription::result::{Segment, TranscriptionResult};

/// Separator between the start and end offsets of a rendered segment (en dash).
const RANGE_SEPARATOR: char = '\u{2013}';

/// Render a transcription result as plain text.
pub fn normalize(result: &TranscriptionResult) -> String {
    match result {
        TranscriptionResult::PlainText(text) => text.clone(),
        TranscriptionResult::WrappedText { text } => text.clone(),
        TranscriptionResult::SegmentList(segments) => segments
            .iter()
            .map(render_segment)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn render_segment(segment: &Segment) -> String {
    format!(
        "[{}{}{}] {}",
        format_time(segment.start()),
        RANGE_SEPARATOR,
        format_time(segment.end()),
        segment.text.trim()
    )
}

/// Format an offset in seconds as `m:ss`.
///
/// Missing or zero offsets render as `"00:00"`, and so does the minute field
/// whenever it is zero. Larger minute counts are not padded (`3661s` is `"61:01"`).
pub fn format_time(seconds: Option<f64>) -> String {
    let s = match seconds {
        Some(s) if s.is_finite() && s > 0.0 => s,
        _ => return "00:00".to_string(),
    };

    let minutes = (s / 60.0).floor() as u64;
    let secs = (s % 60.0).floor() as u64;

    if minutes == 0 {
        format!("00:{:02}", secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}
