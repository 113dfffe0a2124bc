//! # Engine Capability
//!
//! The neural speech-to-text engine is an external capability with two
//! operations:
//!
//! - **load**: build an engine for a [`Fingerprint`], reporting download progress
//! - **run**: transcribe 16 kHz mono samples into a [`TranscriptionResult`]
//!
//! The inference worker only talks to these traits, which keeps the reload and
//! protocol logic testable with the scripted engine in [`testing`].
//!
//! ## Progress Reporting:
//! Loaders never call back into the worker directly. They push [`LoadProgress`]
//! values into a [`ProgressSink`] (an unbounded channel); the worker drains the
//! other end and relays each item as a `progress` message.

use crate::transcription::chunking::ChunkPolicy;
use crate::transcription::fingerprint::Fingerprint;
use crate::transcription::result::TranscriptionResult;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Options for one `run` call.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Window length and overlap
    pub chunking: ChunkPolicy,
    /// ISO 639-1 code, or `None` to auto-detect
    pub language: Option<String>,
    /// Segment-level output instead of plain text
    pub return_timestamps: bool,
}

impl RunOptions {
    /// Build options from the user's language choice; `"auto"` means detect.
    pub fn new(chunking: ChunkPolicy, language: &str, return_timestamps: bool) -> Self {
        let language = match language.trim() {
            "" => None,
            l if l.eq_ignore_ascii_case("auto") => None,
            l => Some(l.to_lowercase()),
        };

        Self {
            chunking,
            language,
            return_timestamps,
        }
    }
}

/// Download/initialization progress for one file of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub file: String,
    /// 0.0 ..= 100.0
    pub percent: f32,
}

/// Sending half of the load-progress stream.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<LoadProgress>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoadProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report progress. Silently dropped if nobody listens anymore.
    pub fn report(&self, file: impl Into<String>, percent: f32) {
        let _ = self.tx.send(LoadProgress {
            file: file.into(),
            percent,
        });
    }
}

/// Sending half of the partial-transcript stream.
///
/// Usable from blocking threads; a disabled sink swallows everything.
#[derive(Debug, Clone)]
pub struct PartialSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl PartialSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.into());
        }
    }
}

/// Builds engines. Implementations may download weights and touch hardware.
#[async_trait]
pub trait EngineLoader: Send + Sync + 'static {
    async fn load(&self, fingerprint: &Fingerprint, progress: ProgressSink) -> Result<Box<dyn SpeechEngine>>;
}

/// A loaded engine. `run` is blocking and is executed off the async runtime.
pub trait SpeechEngine: Send + 'static {
    fn run(&mut self, samples: &[f32], options: &RunOptions, partials: &PartialSink) -> Result<TranscriptionResult>;
}

/// Scripted engine used by the worker and controller tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// What a scripted `run` answers with.
    #[derive(Debug, Clone)]
    pub enum ScriptedOutcome {
        /// Plain text, or segments when timestamps were requested
        Echo(String),
        Fixed(TranscriptionResult),
        Fail(String),
    }

    #[derive(Debug, Clone)]
    pub struct ScriptedLoader {
        pub loads: Arc<AtomicUsize>,
        pub runs: Arc<AtomicUsize>,
        pub files: Vec<String>,
        pub fail_load: Option<String>,
        /// Only fail loads of this model id (all loads when `None`)
        pub fail_model: Option<String>,
        pub outcome: ScriptedOutcome,
        pub seen_options: Arc<Mutex<Vec<RunOptions>>>,
    }

    impl ScriptedLoader {
        pub fn new(outcome: ScriptedOutcome) -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                runs: Arc::new(AtomicUsize::new(0)),
                files: vec!["config.json".to_string(), "model.safetensors".to_string()],
                fail_load: None,
                fail_model: None,
                outcome,
                seen_options: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn failing(message: &str) -> Self {
            let mut loader = Self::new(ScriptedOutcome::Echo(String::new()));
            loader.fail_load = Some(message.to_string());
            loader
        }

        pub fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineLoader for ScriptedLoader {
        async fn load(&self, fingerprint: &Fingerprint, progress: ProgressSink) -> Result<Box<dyn SpeechEngine>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            for file in &self.files {
                progress.report(file.clone(), 0.0);
                progress.report(file.clone(), 50.0);
                progress.report(file.clone(), 100.0);
            }

            if let Some(message) = &self.fail_load {
                let targeted = self.fail_model.as_ref().map_or(true, |id| *id == fingerprint.model_id);
                if targeted {
                    return Err(anyhow!("{}", message));
                }
            }

            Ok(Box::new(ScriptedEngine {
                runs: self.runs.clone(),
                outcome: self.outcome.clone(),
                seen_options: self.seen_options.clone(),
            }))
        }
    }

    pub struct ScriptedEngine {
        runs: Arc<AtomicUsize>,
        outcome: ScriptedOutcome,
        seen_options: Arc<Mutex<Vec<RunOptions>>>,
    }

    impl SpeechEngine for ScriptedEngine {
        fn run(&mut self, samples: &[f32], options: &RunOptions, partials: &PartialSink) -> Result<TranscriptionResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.seen_options.lock().unwrap().push(options.clone());

            match &self.outcome {
                ScriptedOutcome::Echo(text) => {
                    partials.send(text.clone());
                    if options.return_timestamps {
                        let duration = samples.len() as f64 / 16000.0;
                        Ok(TranscriptionResult::SegmentList(vec![
                            crate::transcription::result::Segment::new(0.0, duration, text.clone()),
                        ]))
                    } else {
                        Ok(TranscriptionResult::PlainText(text.clone()))
                    }
                }
                ScriptedOutcome::Fixed(result) => Ok(result.clone()),
                ScriptedOutcome::Fail(message) => Err(anyhow!("{}", message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_language_maps_to_none() {
        let options = RunOptions::new(ChunkPolicy::default(), "auto", false);
        assert_eq!(options.language, None);

        let options = RunOptions::new(ChunkPolicy::default(), "EN", true);
        assert_eq!(options.language.as_deref(), Some("en"));
        assert!(options.return_timestamps);
    }

    #[tokio::test]
    async fn test_progress_sink_streams_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.report("a.bin", 10.0);
        sink.report("a.bin", 90.0);
        drop(sink);

        assert_eq!(rx.recv().await.unwrap().percent, 10.0);
        assert_eq!(rx.recv().await.unwrap().percent, 90.0);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_disabled_partial_sink() {
        let sink = PartialSink::disabled();
        assert!(!sink.is_enabled());
        sink.send("ignored");
    }
}
