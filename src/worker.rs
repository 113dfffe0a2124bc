//! # Inference Worker
//!
//! Owns the one live speech engine and serves [`WorkerCommand`]s strictly in
//! arrival order on its own task. The controller never touches the engine; it
//! only sees the [`WorkerEvent`]s coming back.
//!
//! ## Load Handling:
//! 1. Same fingerprint as the live engine → `ready`
//! 2. Otherwise `loading` (plus `info` for accelerated devices), then the
//!    engine load with every [`LoadProgress`](crate::transcription::engine::LoadProgress)
//!    relayed as `progress`, then `ready` or `error`
//!
//! A failed reload leaves the previous engine in place.
//!
//! ## Run Handling:
//! Ignored when no engine is live. Otherwise `working`, then the blocking
//! inference call on a `spawn_blocking` thread (the engine is moved there and
//! back), then `complete` or `error`. A panicking run loses the engine.

use crate::protocol::{WorkerCommand, WorkerEvent};
use crate::transcription::chunking::ChunkPolicy;
use crate::transcription::engine::{EngineLoader, PartialSink, ProgressSink, RunOptions, SpeechEngine};
use crate::transcription::fingerprint::{ComputeDevice, EngineCache, Fingerprint};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LOADING_TEXT: &str = "Loading model...";
const ACCELERATED_INFO_TEXT: &str =
    "Using accelerated compute. The first load initializes GPU kernels and may take a while.";
const WORKING_TEXT: &str = "Transcribing audio...";

/// Inference options fixed for the worker's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub chunking: ChunkPolicy,
    /// Relay per-window text as `partial` events
    pub emit_partials: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkPolicy::default(),
            emit_partials: false,
        }
    }
}

/// Both ends the controller needs, plus the worker task handle.
pub struct WorkerChannels {
    pub commands: mpsc::Sender<WorkerCommand>,
    pub events: mpsc::Receiver<WorkerEvent>,
    pub handle: JoinHandle<()>,
}

/// Start the inference worker on its own task.
///
/// ## Parameters:
/// - **loader**: Engine capability used for every (re)load
/// - **settings**: Chunking and partial-output options
/// - **capacity**: Bound of each direction's channel
///
/// The worker stops once every command sender is dropped.
pub fn spawn_worker(loader: Arc<dyn EngineLoader>, settings: WorkerSettings, capacity: usize) -> WorkerChannels {
    let (command_tx, command_rx) = mpsc::channel(capacity.max(1));
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));

    let worker = InferenceWorker::new(loader, settings, event_tx);
    let handle = tokio::spawn(worker.run(command_rx));

    WorkerChannels {
        commands: command_tx,
        events: event_rx,
        handle,
    }
}

pub struct InferenceWorker {
    loader: Arc<dyn EngineLoader>,
    cache: EngineCache<Box<dyn SpeechEngine>>,
    settings: WorkerSettings,
    events: mpsc::Sender<WorkerEvent>,
}

impl InferenceWorker {
    pub fn new(loader: Arc<dyn EngineLoader>, settings: WorkerSettings, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            loader,
            cache: EngineCache::new(),
            settings,
            events,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        info!("Inference worker started");

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Load(fingerprint) => self.handle_load(fingerprint).await,
                WorkerCommand::Run {
                    audio,
                    language,
                    timestamps,
                } => self.handle_run(audio, language, timestamps).await,
            }
        }

        info!("Inference worker stopped, command channel closed");
    }

    async fn handle_load(&mut self, fingerprint: Fingerprint) {
        if !self.cache.needs_reload(&fingerprint) {
            debug!(model = %fingerprint.model_id, "Engine already loaded, skipping reload");
            emit(&self.events, WorkerEvent::Ready).await;
            return;
        }

        emit(&self.events, WorkerEvent::Loading {
            text: LOADING_TEXT.to_string(),
        })
        .await;
        if fingerprint.device == ComputeDevice::Accelerated {
            emit(&self.events, WorkerEvent::Info {
                text: ACCELERATED_INFO_TEXT.to_string(),
            })
            .await;
        }

        let started = Instant::now();
        let (sink, progress) = ProgressSink::channel();
        let relay = relay_progress(self.events.clone(), progress);
        let (result, ()) = tokio::join!(self.loader.load(&fingerprint, sink), relay);

        match result {
            Ok(engine) => {
                info!(
                    model = %fingerprint.model_id,
                    device = %fingerprint.device,
                    precision = %fingerprint.precision,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Engine loaded"
                );
                self.cache.install(fingerprint, engine);
                emit(&self.events, WorkerEvent::Ready).await;
            }
            Err(e) => {
                error!(model = %fingerprint.model_id, device = %fingerprint.device, "Engine load failed: {:#}", e);
                emit(&self.events, WorkerEvent::Error {
                    message: load_failure_message(&fingerprint, &e),
                })
                .await;
            }
        }
    }

    async fn handle_run(&mut self, audio: Vec<f32>, language: String, timestamps: bool) {
        let Some((fingerprint, mut engine)) = self.cache.take() else {
            warn!("Run received with no engine loaded, ignoring");
            return;
        };

        emit(&self.events, WorkerEvent::Working {
            text: WORKING_TEXT.to_string(),
        })
        .await;

        let options = RunOptions::new(self.settings.chunking, &language, timestamps);
        let (partials, partial_rx) = if self.settings.emit_partials {
            let (sink, rx) = PartialSink::channel();
            (sink, Some(rx))
        } else {
            (PartialSink::disabled(), None)
        };

        let started = Instant::now();
        let sample_count = audio.len();
        let task = tokio::task::spawn_blocking(move || {
            let result = engine.run(&audio, &options, &partials);
            (engine, result)
        });
        let (joined, ()) = tokio::join!(task, relay_partials(self.events.clone(), partial_rx));

        match joined {
            Ok((engine, Ok(result))) => {
                info!(
                    samples = sample_count,
                    shape = result.shape(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Inference finished"
                );
                self.cache.install(fingerprint, engine);
                emit(&self.events, WorkerEvent::Complete { result }).await;
            }
            Ok((engine, Err(e))) => {
                error!("Inference failed: {:#}", e);
                self.cache.install(fingerprint, engine);
                emit(&self.events, WorkerEvent::Error { message: e.to_string() }).await;
            }
            Err(join_error) => {
                error!("Inference task aborted, dropping engine: {}", join_error);
                self.cache.clear();
                emit(&self.events, WorkerEvent::Error {
                    message: format!("inference task aborted: {}", join_error),
                })
                .await;
            }
        }
    }
}

/// Borrows only the sender so the worker future stays `Send` for any engine.
async fn emit(events: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
    debug!(event = event.tag(), "Worker event");
    if events.send(event).await.is_err() {
        warn!("Worker event dropped, controller is gone");
    }
}

/// Error text for a failed load. Accelerated failures point at the alternatives.
fn load_failure_message(fingerprint: &Fingerprint, err: &anyhow::Error) -> String {
    match fingerprint.device {
        ComputeDevice::Portable => format!("Failed to load model {}: {}", fingerprint.model_id, err),
        ComputeDevice::Accelerated => format!(
            "Failed to load model {} on the accelerated device: {}. Try the portable device or a smaller model.",
            fingerprint.model_id, err
        ),
    }
}

async fn relay_progress(
    events: mpsc::Sender<WorkerEvent>,
    mut progress: mpsc::UnboundedReceiver<crate::transcription::engine::LoadProgress>,
) {
    while let Some(item) = progress.recv().await {
        let event = WorkerEvent::Progress {
            file: item.file,
            percent: item.percent,
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn relay_partials(events: mpsc::Sender<WorkerEvent>, partials: Option<mpsc::UnboundedReceiver<String>>) {
    let Some(mut partials) = partials else {
        return;
    };
    while let Some(text) = partials.recv().await {
        if events.send(WorkerEvent::Partial { text }).await.is_err() {
            break;
        }
    }
}
