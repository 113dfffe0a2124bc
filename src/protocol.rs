//! # Worker Message Protocol
//!
//! The session controller and the inference worker share no memory. Everything
//! they tell each other travels as owned values over two ordered channels:
//!
//! ```text
//! controller ── WorkerCommand ──▶ worker
//! controller ◀── WorkerEvent ─── worker
//! ```
//!
//! ## Wire Shape:
//! Both enums serialize as `{ "type": <tag>, ...fields }`, for example
//! `{"type":"progress","file":"model.safetensors","percent":42.0}`.
//!
//! ## Ordering Within One Job:
//! `loading? info? progress* ready working partial* (complete | error)`

use crate::transcription::fingerprint::Fingerprint;
use crate::transcription::result::TranscriptionResult;
use serde::{Deserialize, Serialize};

/// Requests sent to the inference worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerCommand {
    /// Make sure an engine for this fingerprint is live, then answer `ready`
    Load(Fingerprint),
    /// Transcribe decoded samples with the live engine
    Run {
        audio: Vec<f32>,
        /// ISO code or `"auto"`
        language: String,
        timestamps: bool,
    },
}

/// Notifications sent back by the inference worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// Per-file download/initialization progress, `percent` in `0.0..=100.0`
    Progress { file: String, percent: f32 },
    Loading { text: String },
    Info { text: String },
    /// The requested engine is live
    Ready,
    Working { text: String },
    /// Text of one decoded window, only when partial output is enabled
    Partial { text: String },
    Complete { result: TranscriptionResult },
    Error { message: String },
}

impl WorkerEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            WorkerEvent::Progress { .. } => "progress",
            WorkerEvent::Loading { .. } => "loading",
            WorkerEvent::Info { .. } => "info",
            WorkerEvent::Ready => "ready",
            WorkerEvent::Working { .. } => "working",
            WorkerEvent::Partial { .. } => "partial",
            WorkerEvent::Complete { .. } => "complete",
            WorkerEvent::Error { .. } => "error",
        }
    }
}
