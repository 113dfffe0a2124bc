//! # Transcription Results
//!
//! The inference engine can answer in three shapes: a bare string, a list of
//! time-stamped segments, or an object wrapping the text. They are modelled as
//! one tagged union so consumers match on variants instead of inspecting JSON.
//!
//! ## Wire Format:
//! ```json
//! "hello world"
//! [{"timestamp": [0.0, 2.0], "text": "hello"}, {"timestamp": [2.0, null], "text": "world"}]
//! {"text": "hello world"}
//! ```
//! Deserialization is untagged: the JSON shape alone selects the variant.

use serde::{Deserialize, Serialize};

/// A time-bounded span of transcribed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// `[start, end]` offsets in seconds; either bound may be missing
    pub timestamp: (Option<f64>, Option<f64>),
    pub text: String,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            timestamp: (Some(start), Some(end)),
            text: text.into(),
        }
    }

    pub fn start(&self) -> Option<f64> {
        self.timestamp.0
    }

    pub fn end(&self) -> Option<f64> {
        self.timestamp.1
    }
}

/// Raw output of one completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranscriptionResult {
    PlainText(String),
    SegmentList(Vec<Segment>),
    WrappedText { text: String },
}

impl TranscriptionResult {
    /// Short description used in logs.
    pub fn shape(&self) -> &'static str {
        match self {
            TranscriptionResult::PlainText(_) => "plain_text",
            TranscriptionResult::SegmentList(_) => "segment_list",
            TranscriptionResult::WrappedText { .. } => "wrapped_text",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_shapes() {
        let plain: TranscriptionResult = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(plain, TranscriptionResult::PlainText("hello".to_string()));

        let wrapped: TranscriptionResult = serde_json::from_str(r#"{"text": "hi there"}"#).unwrap();
        assert_eq!(
            wrapped,
            TranscriptionResult::WrappedText { text: "hi there".to_string() }
        );

        let segments: TranscriptionResult = serde_json::from_str(
            r#"[{"timestamp": [0.0, 2.5], "text": "hi"}, {"timestamp": [2.5, null], "text": "there"}]"#,
        )
        .unwrap();
        match segments {
            TranscriptionResult::SegmentList(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].start(), Some(0.0));
                assert_eq!(list[0].end(), Some(2.5));
                assert_eq!(list[1].end(), None);
            }
            other => panic!("expected segments, got {:?}", other),
        }
    }

    #[test]
    fn test_shape_names() {
        assert_eq!(TranscriptionResult::PlainText(String::new()).shape(), "plain_text");
        assert_eq!(TranscriptionResult::SegmentList(vec![]).shape(), "segment_list");
    }
}
