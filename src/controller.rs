//! # Session Controller
//!
//! The front-facing half of the orchestrator. It owns the session state, admits
//! at most one job at a time, turns a submitted file into protocol messages for
//! the inference worker and turns the worker's answers into presentation events.
//!
//! ## Job Lifecycle:
//! ```text
//! Idle ─submit─▶ Decoding ─decoded─▶ AwaitingEngine ─ready─▶ Transcribing ─complete─▶ Done ─▶ Idle
//!                    │                     │                       │
//!                    └──── decode error ───┴──── error ────────────┴──────────────────▶ Failed ─▶ Idle
//! ```
//!
//! ## Single-Flight Admission:
//! `busy` is set when a job is admitted and cleared only by a terminal outcome
//! (`complete`, `error` or a decode failure). A submission while busy is
//! answered with `false` and changes nothing else.
//!
//! ## Threading:
//! The controller runs on its own task ([`spawn_session`]) and `select!`s over
//! three inputs: submissions from HTTP handlers, decode results from blocking
//! threads and worker events. Handlers talk to it through a [`SessionHandle`].

use crate::audio::decoder::AudioDecoder;
use crate::config::AppConfig;
use crate::error::{DecodeError, TranscriptionError};
use crate::protocol::{WorkerCommand, WorkerEvent};
use crate::transcription::fingerprint::{ComputeDevice, Fingerprint, Precision};
use crate::transcription::normalizer::normalize;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DECODING_LABEL: &str = "Decoding audio...";
const AWAITING_ENGINE_LABEL: &str = "Loading model...";
const TRANSCRIBING_LABEL: &str = "Processing audio...";

/// Where the current job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Decoding,
    AwaitingEngine,
    Transcribing,
    Done,
    Failed,
}

/// Controller-owned job state.
#[derive(Debug, Default)]
pub struct SessionState {
    pub busy: bool,
    /// Decoded samples waiting for the engine to become ready
    pub pending_audio: Option<Vec<f32>>,
    pub last_progress_percent: u8,
}

/// Per-job choices, resolved from configuration and upload fields at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub fingerprint: Fingerprint,
    /// ISO code or `"auto"`
    pub language: String,
    pub timestamps: bool,
}

impl JobSettings {
    /// Defaults from the current configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let device: ComputeDevice = config.models.default_device.parse().map_err(|e: String| anyhow!(e))?;
        let precision: Precision = config.models.default_precision.parse().map_err(|e: String| anyhow!(e))?;

        Ok(Self {
            fingerprint: Fingerprint::new(config.models.default_model.clone(), device, precision),
            language: config.transcription.default_language.clone(),
            timestamps: config.transcription.return_timestamps,
        })
    }
}

/// A file handed over by the acquisition layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

struct JobContext {
    id: Uuid,
    settings: JobSettings,
    started: Instant,
}

/// Everything the presentation layer is told, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresentationEvent {
    JobStarted { job_id: Uuid, file_name: String },
    Phase { phase: SessionPhase, busy: bool },
    Status { label: String },
    Progress { file: String, percent: u8, label: String },
    Partial { text: String },
    Output { text: String },
    Failure { kind: String, message: String },
    /// The worker reported a live engine for this fingerprint
    EngineReady { fingerprint: Fingerprint },
}

/// Latest rendered state, readable at any time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub busy: bool,
    pub job_id: Option<Uuid>,
    pub file_name: Option<String>,
    pub label: String,
    pub percent: u8,
    pub partial: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Engine the worker last reported ready
    pub engine: Option<Fingerprint>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            busy: false,
            job_id: None,
            file_name: None,
            label: String::new(),
            percent: 0,
            partial: String::new(),
            output: None,
            error: None,
            completed_jobs: 0,
            failed_jobs: 0,
            engine: None,
            updated_at: Utc::now(),
        }
    }
}

impl SessionSnapshot {
    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: &PresentationEvent) {
        match event {
            PresentationEvent::JobStarted { job_id, file_name } => {
                self.job_id = Some(*job_id);
                self.file_name = Some(file_name.clone());
                self.percent = 0;
                self.partial.clear();
                self.output = None;
                self.error = None;
            }
            PresentationEvent::Phase { phase, busy } => {
                self.phase = *phase;
                self.busy = *busy;
            }
            PresentationEvent::Status { label } => self.label = label.clone(),
            PresentationEvent::Progress { percent, label, .. } => {
                self.percent = *percent;
                self.label = label.clone();
            }
            PresentationEvent::Partial { text } => {
                if !self.partial.is_empty() {
                    self.partial.push(' ');
                }
                self.partial.push_str(text.trim());
            }
            PresentationEvent::Output { text } => {
                self.output = Some(text.clone());
                self.completed_jobs += 1;
            }
            PresentationEvent::Failure { message, .. } => {
                self.partial.clear();
                self.error = Some(message.clone());
                self.failed_jobs += 1;
            }
            PresentationEvent::EngineReady { fingerprint } => self.engine = Some(fingerprint.clone()),
        }
        self.updated_at = Utc::now();
    }
}

/// Publishes presentation events and keeps the snapshot in step with them.
#[derive(Debug, Clone)]
pub struct Presenter {
    updates: broadcast::Sender<PresentationEvent>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl Presenter {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            updates,
            snapshot: Arc::new(RwLock::new(SessionSnapshot::default())),
        }
    }

    pub fn publish(&self, event: PresentationEvent) {
        self.snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(&event);
        // No subscribers is fine, the snapshot still has it.
        let _ = self.updates.send(event);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresentationEvent> {
        self.updates.subscribe()
    }
}

/// Result of a decode running on a blocking thread.
pub struct DecodeOutcome {
    job_id: Uuid,
    result: Result<Vec<f32>, DecodeError>,
}

/// Round a raw progress value for display.
pub fn display_percent(percent: f32) -> u8 {
    if percent.is_finite() {
        percent.round().clamp(0.0, 100.0) as u8
    } else {
        0
    }
}

pub struct SessionController {
    state: SessionState,
    phase: SessionPhase,
    job: Option<JobContext>,
    commands: mpsc::Sender<WorkerCommand>,
    decoder: Arc<dyn AudioDecoder>,
    decoded: mpsc::UnboundedSender<DecodeOutcome>,
    presenter: Presenter,
}

impl SessionController {
    pub fn new(
        commands: mpsc::Sender<WorkerCommand>,
        decoder: Arc<dyn AudioDecoder>,
        decoded: mpsc::UnboundedSender<DecodeOutcome>,
        presenter: Presenter,
    ) -> Self {
        Self {
            state: SessionState::default(),
            phase: SessionPhase::Idle,
            job: None,
            commands,
            decoder,
            decoded,
            presenter,
        }
    }

    /// Admit a job, or do nothing if one is already running.
    ///
    /// ## Returns:
    /// - **true**: Job admitted, decoding has started
    /// - **false**: Busy, the submission was dropped
    pub fn submit_job(&mut self, file: UploadedFile, settings: JobSettings) -> bool {
        if self.state.busy {
            warn!(file = %file.name, "Submission rejected, a job is already in flight");
            return false;
        }

        let job = JobContext {
            id: Uuid::new_v4(),
            settings,
            started: Instant::now(),
        };
        let job_id = job.id;
        info!(
            job_id = %job_id,
            file = %file.name,
            bytes = file.bytes.len(),
            model = %job.settings.fingerprint.model_id,
            device = %job.settings.fingerprint.device,
            "Job admitted"
        );

        self.state.busy = true;
        self.state.last_progress_percent = 0;
        self.job = Some(job);
        self.presenter.publish(PresentationEvent::JobStarted {
            job_id,
            file_name: file.name.clone(),
        });
        self.enter(SessionPhase::Decoding, DECODING_LABEL);

        let decoder = self.decoder.clone();
        let decoded = self.decoded.clone();
        tokio::spawn(async move {
            let decoding = tokio::task::spawn_blocking(move || decoder.decode(&file.name, &file.bytes));
            let result = match decoding.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(job_id = %job_id, "Decode task aborted: {}", join_error);
                    Err(DecodeError::Corrupt("the decoder stopped unexpectedly".to_string()))
                }
            };
            let _ = decoded.send(DecodeOutcome { job_id, result });
        });

        true
    }

    /// Continue a job once its audio is decoded.
    pub async fn handle_decoded(&mut self, outcome: DecodeOutcome) {
        let Some(job) = self.job.as_ref().filter(|job| job.id == outcome.job_id) else {
            debug!(job_id = %outcome.job_id, "Decode result for a job that is no longer current");
            return;
        };
        let fingerprint = job.settings.fingerprint.clone();

        match outcome.result {
            Err(e) => self.fail(TranscriptionError::Decode(e)),
            Ok(samples) => {
                debug!(job_id = %outcome.job_id, samples = samples.len(), "Audio decoded");
                self.state.pending_audio = Some(samples);
                self.enter(SessionPhase::AwaitingEngine, AWAITING_ENGINE_LABEL);
                self.send(WorkerCommand::Load(fingerprint)).await;
            }
        }
    }

    /// React to one message from the worker.
    pub async fn handle_event(&mut self, event: WorkerEvent) {
        debug!(event = event.tag(), phase = ?self.phase, "Worker event received");

        match event {
            WorkerEvent::Progress { file, percent } => {
                let percent = display_percent(percent);
                if percent < self.state.last_progress_percent {
                    debug!(file = %file, percent, previous = self.state.last_progress_percent, "Progress moved backwards");
                }
                self.state.last_progress_percent = percent;
                let label = format!("Loading {}: {}%", file, percent);
                self.presenter.publish(PresentationEvent::Progress { file, percent, label });
            }
            WorkerEvent::Loading { text } | WorkerEvent::Info { text } | WorkerEvent::Working { text } => {
                self.presenter.publish(PresentationEvent::Status { label: text });
            }
            WorkerEvent::Partial { text } => {
                self.presenter.publish(PresentationEvent::Partial { text });
            }
            WorkerEvent::Ready => self.on_ready().await,
            WorkerEvent::Complete { result } => {
                if self.job.is_none() {
                    warn!("Completion received with no job in flight, ignoring");
                    return;
                }
                let text = normalize(&result);
                self.enter(SessionPhase::Done, "Done");
                self.presenter.publish(PresentationEvent::Output { text });
                self.finish();
            }
            WorkerEvent::Error { message } => {
                let error = match self.phase {
                    SessionPhase::AwaitingEngine => TranscriptionError::EngineLoad(message),
                    SessionPhase::Transcribing => TranscriptionError::InferenceRuntime(message),
                    _ => {
                        warn!(message = %message, "Worker error received with no job in flight, ignoring");
                        return;
                    }
                };
                self.fail(error);
            }
        }
    }

    /// Called when the worker's event stream ends.
    pub fn worker_stopped(&mut self) {
        if self.job.is_some() {
            self.fail(TranscriptionError::InferenceRuntime("inference worker is not running".to_string()));
        }
    }

    async fn on_ready(&mut self) {
        let Some(job) = self.job.as_ref().filter(|_| self.phase == SessionPhase::AwaitingEngine) else {
            warn!(phase = ?self.phase, "Ready received while no job is waiting for the engine, ignoring");
            return;
        };
        let Some(audio) = self.state.pending_audio.take() else {
            warn!("Ready received without pending audio, ignoring");
            return;
        };

        self.presenter.publish(PresentationEvent::EngineReady {
            fingerprint: job.settings.fingerprint.clone(),
        });
        let command = WorkerCommand::Run {
            audio,
            language: job.settings.language.clone(),
            timestamps: job.settings.timestamps,
        };
        self.enter(SessionPhase::Transcribing, TRANSCRIBING_LABEL);
        self.send(command).await;
    }

    async fn send(&mut self, command: WorkerCommand) {
        if self.commands.send(command).await.is_err() {
            error!("Inference worker channel closed");
            self.fail(TranscriptionError::InferenceRuntime("inference worker is not running".to_string()));
        }
    }

    fn enter(&mut self, phase: SessionPhase, label: &str) {
        self.phase = phase;
        self.presenter.publish(PresentationEvent::Phase {
            phase,
            busy: self.state.busy,
        });
        self.presenter.publish(PresentationEvent::Status {
            label: label.to_string(),
        });
    }

    fn fail(&mut self, error: TranscriptionError) {
        if let Some(job) = &self.job {
            error!(job_id = %job.id, kind = error.kind(), "Job failed: {}", error);
        }
        self.enter(SessionPhase::Failed, "Failed");
        self.presenter.publish(PresentationEvent::Failure {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        self.finish();
    }

    /// Release the busy guard and return to idle.
    fn finish(&mut self) {
        if let Some(job) = self.job.take() {
            info!(
                job_id = %job.id,
                outcome = ?self.phase,
                duration_ms = job.started.elapsed().as_millis() as u64,
                "Job finished"
            );
        }
        self.state.busy = false;
        self.state.pending_audio = None;
        self.enter(SessionPhase::Idle, "");
    }
}

/// Messages accepted by the controller task.
pub enum SessionInput {
    Submit {
        file: UploadedFile,
        settings: JobSettings,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable front door to the controller task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inputs: mpsc::Sender<SessionInput>,
    presenter: Presenter,
}

impl SessionHandle {
    /// Submit a file. Resolves to whether the job was admitted.
    pub async fn submit(&self, file: UploadedFile, settings: JobSettings) -> Result<bool> {
        let (reply, answer) = oneshot::channel();
        self.inputs
            .send(SessionInput::Submit { file, settings, reply })
            .await
            .map_err(|_| anyhow!("session controller is not running"))?;
        answer.await.map_err(|_| anyhow!("session controller dropped the submission"))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.presenter.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresentationEvent> {
        self.presenter.subscribe()
    }
}

/// Start the controller task.
///
/// ## Parameters:
/// - **commands** / **events**: The worker's channel ends
/// - **decoder**: Audio decode capability
/// - **capacity**: Bound of the submission channel and the presentation broadcast
///
/// The task stops when every [`SessionHandle`] is dropped.
pub fn spawn_session(
    commands: mpsc::Sender<WorkerCommand>,
    mut events: mpsc::Receiver<WorkerEvent>,
    decoder: Arc<dyn AudioDecoder>,
    capacity: usize,
) -> (SessionHandle, JoinHandle<()>) {
    let (input_tx, mut inputs) = mpsc::channel(capacity.max(1));
    let (decoded_tx, mut decoded) = mpsc::unbounded_channel();
    let presenter = Presenter::new(capacity.max(64));

    let handle = SessionHandle {
        inputs: input_tx,
        presenter: presenter.clone(),
    };
    let mut controller = SessionController::new(commands, decoder, decoded_tx, presenter);

    let task = tokio::spawn(async move {
        info!("Session controller started");
        let mut worker_alive = true;

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::Submit { file, settings, reply }) => {
                        let accepted = controller.submit_job(file, settings);
                        let _ = reply.send(accepted);
                    }
                    None => break,
                },
                Some(outcome) = decoded.recv() => controller.handle_decoded(outcome).await,
                event = events.recv(), if worker_alive => match event {
                    Some(event) => controller.handle_event(event).await,
                    None => {
                        error!("Inference worker stopped unexpectedly");
                        worker_alive = false;
                        controller.worker_stopped();
                    }
                },
            }
        }

        info!("Session controller stopped");
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::testing::{tone, wav_bytes};
    use crate::audio::decoder::MediaDecoder;
    use crate::transcription::engine::testing::{ScriptedLoader, ScriptedOutcome};
    use crate::transcription::result::{Segment, TranscriptionResult};
    use crate::worker::{spawn_worker, WorkerSettings};
    use std::sync::Mutex;
    use std::time::Duration;

    fn settings() -> JobSettings {
        JobSettings {
            fingerprint: Fingerprint::new("openai/whisper-tiny", ComputeDevice::Portable, Precision::Full),
            language: "auto".to_string(),
            timestamps: false,
        }
    }

    fn ten_second_wav() -> UploadedFile {
        UploadedFile {
            name: "sample.wav".to_string(),
            bytes: wav_bytes(&tone(10.0, 16000), 16000, 1),
        }
    }

    fn start(loader: &ScriptedLoader, decoder: Arc<dyn AudioDecoder>) -> SessionHandle {
        let worker = spawn_worker(Arc::new(loader.clone()), WorkerSettings::default(), 32);
        let (handle, _task) = spawn_session(worker.commands, worker.events, decoder, 32);
        handle
    }

    /// Collect presentation events until the session is idle again.
    async fn until_idle(updates: &mut broadcast::Receiver<PresentationEvent>) -> Vec<PresentationEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .expect("session did not settle")
                .expect("presentation stream closed");
            let idle = matches!(event, PresentationEvent::Phase { phase: SessionPhase::Idle, .. });
            events.push(event);
            if idle {
                return events;
            }
        }
    }

    fn phases(events: &[PresentationEvent]) -> Vec<SessionPhase> {
        events
            .iter()
            .filter_map(|e| match e {
                PresentationEvent::Phase { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    /// Decoder that blocks until the test releases it.
    struct GatedDecoder {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        inner: MediaDecoder,
    }

    impl AudioDecoder for GatedDecoder {
        fn decode(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
            let _ = self.gate.lock().unwrap().recv();
            self.inner.decode(file_name, bytes)
        }
    }

    #[tokio::test]
    async fn test_end_to_end_plain_text() {
        let loader = ScriptedLoader::new(ScriptedOutcome::Echo("ten seconds of speech".into()));
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        let events = until_idle(&mut updates).await;

        assert_eq!(
            phases(&events),
            vec![
                SessionPhase::Decoding,
                SessionPhase::AwaitingEngine,
                SessionPhase::Transcribing,
                SessionPhase::Done,
                SessionPhase::Idle
            ]
        );
        assert!(events.contains(&PresentationEvent::Output {
            text: "ten seconds of speech".into()
        }));

        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.phase, SessionPhase::Idle);
        assert_eq!(snapshot.output.as_deref(), Some("ten seconds of speech"));
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.percent, 100);
        assert_eq!(loader.seen_options.lock().unwrap()[0].language, None);
    }

    #[tokio::test]
    async fn test_progress_labels_precede_processing() {
        let loader = ScriptedLoader::new(ScriptedOutcome::Echo("hi".into()));
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        handle.submit(ten_second_wav(), settings()).await.unwrap();
        let events = until_idle(&mut updates).await;

        let labels: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                PresentationEvent::Progress { label, .. } | PresentationEvent::Status { label } => Some(label.as_str()),
                _ => None,
            })
            .collect();
        let loading = labels.iter().position(|l| *l == "Loading model.safetensors: 50%").unwrap();
        let processing = labels.iter().position(|l| *l == TRANSCRIBING_LABEL).unwrap();
        let working = labels.iter().position(|l| *l == "Transcribing audio...").unwrap();
        assert!(loading < processing && processing < working);
    }

    #[tokio::test]
    async fn test_submission_while_busy_is_a_no_op() {
        let (release, gate) = std::sync::mpsc::channel();
        let decoder = GatedDecoder {
            gate: Mutex::new(gate),
            inner: MediaDecoder::default(),
        };
        let loader = ScriptedLoader::new(ScriptedOutcome::Echo("first".into()));
        let handle = start(&loader, Arc::new(decoder));
        let mut updates = handle.subscribe();

        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        let before = handle.snapshot();
        assert!(!handle.submit(ten_second_wav(), settings()).await.unwrap());
        let after = handle.snapshot();

        assert_eq!(before.job_id, after.job_id);
        assert_eq!(after.phase, SessionPhase::Decoding);
        assert_eq!(loader.load_count(), 0);

        release.send(()).unwrap();
        until_idle(&mut updates).await;
        assert_eq!(handle.snapshot().completed_jobs, 1);
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_second_job_reuses_engine() {
        let loader = ScriptedLoader::new(ScriptedOutcome::Echo("again".into()));
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        handle.submit(ten_second_wav(), settings()).await.unwrap();
        until_idle(&mut updates).await;
        handle.submit(ten_second_wav(), settings()).await.unwrap();
        let events = until_idle(&mut updates).await;

        assert_eq!(loader.load_count(), 1);
        assert!(!events.iter().any(|e| matches!(e, PresentationEvent::Progress { .. })));
        assert_eq!(handle.snapshot().engine, Some(settings().fingerprint));
        assert_eq!(handle.snapshot().completed_jobs, 2);
    }

    #[tokio::test]
    async fn test_decode_failure_skips_worker() {
        let loader = ScriptedLoader::new(ScriptedOutcome::Echo("unused".into()));
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        let empty = UploadedFile {
            name: "empty.wav".into(),
            bytes: Vec::new(),
        };
        assert!(handle.submit(empty, settings()).await.unwrap());
        let events = until_idle(&mut updates).await;

        assert_eq!(
            phases(&events),
            vec![SessionPhase::Decoding, SessionPhase::Failed, SessionPhase::Idle]
        );
        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.error.as_deref(), Some("Could not read your file: the file is empty"));
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_error_surfaces_verbatim() {
        let loader = ScriptedLoader::new(ScriptedOutcome::Fail("decoder ran out of memory".into()));
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        handle.submit(ten_second_wav(), settings()).await.unwrap();
        let events = until_idle(&mut updates).await;

        assert!(events.contains(&PresentationEvent::Failure {
            kind: "transcription".into(),
            message: "Transcription failed: decoder ran out of memory".into(),
        }));
        assert!(!events.iter().any(|e| matches!(e, PresentationEvent::Output { .. })));
        assert!(!handle.snapshot().busy);
    }

    #[tokio::test]
    async fn test_timestamped_output_is_normalized() {
        let result = TranscriptionResult::SegmentList(vec![Segment::new(0.0, 2.0, "hi"), Segment::new(2.0, 5.0, "there")]);
        let loader = ScriptedLoader::new(ScriptedOutcome::Fixed(result));
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        let mut with_timestamps = settings();
        with_timestamps.timestamps = true;
        handle.submit(ten_second_wav(), with_timestamps).await.unwrap();
        until_idle(&mut updates).await;

        assert_eq!(
            handle.snapshot().output.as_deref(),
            Some("[00:00–00:02] hi\n[00:02–00:05] there")
        );
        assert!(loader.seen_options.lock().unwrap()[0].return_timestamps);
    }

    struct PanickingDecoder;

    impl AudioDecoder for PanickingDecoder {
        fn decode(&self, _file_name: &str, _bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
            panic!("decoder blew up");
        }
    }

    /// Controller wired to bare channels so the test plays the worker.
    fn start_detached() -> (SessionHandle, mpsc::Receiver<WorkerCommand>, mpsc::Sender<WorkerEvent>) {
        let (commands, command_rx) = mpsc::channel(8);
        let (event_tx, events) = mpsc::channel(8);
        let (handle, _task) = spawn_session(commands, events, Arc::new(MediaDecoder::default()), 32);
        (handle, command_rx, event_tx)
    }

    async fn next_command(commands: &mut mpsc::Receiver<WorkerCommand>) -> WorkerCommand {
        tokio::time::timeout(Duration::from_secs(5), commands.recv())
            .await
            .expect("controller sent no command")
            .expect("controller dropped the command channel")
    }

    #[tokio::test]
    async fn test_decoder_panic_releases_busy_guard() {
        let loader = ScriptedLoader::new(ScriptedOutcome::Echo("unused".into()));
        let handle = start(&loader, Arc::new(PanickingDecoder));
        let mut updates = handle.subscribe();

        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        let events = until_idle(&mut updates).await;

        assert_eq!(
            phases(&events),
            vec![SessionPhase::Decoding, SessionPhase::Failed, SessionPhase::Idle]
        );
        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Could not read your file: corrupt audio data (the decoder stopped unexpectedly)")
        );

        // the session takes new work afterwards
        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        until_idle(&mut updates).await;
        assert_eq!(handle.snapshot().failed_jobs, 2);
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_load_failure_ends_job() {
        let loader = ScriptedLoader::failing("disk full");
        let handle = start(&loader, Arc::new(MediaDecoder::default()));
        let mut updates = handle.subscribe();

        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        let events = until_idle(&mut updates).await;

        assert_eq!(
            phases(&events),
            vec![
                SessionPhase::Decoding,
                SessionPhase::AwaitingEngine,
                SessionPhase::Failed,
                SessionPhase::Idle
            ]
        );
        assert!(events.contains(&PresentationEvent::Failure {
            kind: "transcription".into(),
            message: "Transcription failed: Failed to load model openai/whisper-tiny: disk full".into(),
        }));
        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.engine, None);
        assert_eq!(loader.runs.load(std::sync::atomic::Ordering::SeqCst), 0);

        // nothing was cached, so the next job loads again
        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        until_idle(&mut updates).await;
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_command_channel_fails_job() {
        let (handle, command_rx, _event_tx) = start_detached();
        drop(command_rx);
        let mut updates = handle.subscribe();

        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        let events = until_idle(&mut updates).await;

        assert_eq!(
            phases(&events),
            vec![
                SessionPhase::Decoding,
                SessionPhase::AwaitingEngine,
                SessionPhase::Failed,
                SessionPhase::Idle
            ]
        );
        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Transcription failed: inference worker is not running")
        );
    }

    #[tokio::test]
    async fn test_worker_exit_mid_job_fails_job() {
        let (handle, mut command_rx, event_tx) = start_detached();
        let mut updates = handle.subscribe();

        assert!(handle.submit(ten_second_wav(), settings()).await.unwrap());
        assert!(matches!(next_command(&mut command_rx).await, WorkerCommand::Load(_)));
        assert!(handle.snapshot().busy);

        drop(event_tx);
        until_idle(&mut updates).await;

        let snapshot = handle.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Transcription failed: inference worker is not running")
        );
    }

    #[tokio::test]
    async fn test_progress_regression_is_shown_as_received() {
        let (handle, mut command_rx, event_tx) = start_detached();
        let mut updates = handle.subscribe();

        handle.submit(ten_second_wav(), settings()).await.unwrap();
        assert!(matches!(next_command(&mut command_rx).await, WorkerCommand::Load(_)));

        for (file, percent) in [("config.json", 100.0), ("model.safetensors", 12.4)] {
            event_tx
                .send(WorkerEvent::Progress { file: file.into(), percent })
                .await
                .unwrap();
        }
        event_tx
            .send(WorkerEvent::Error { message: "cancelled".into() })
            .await
            .unwrap();
        let events = until_idle(&mut updates).await;

        let shown: Vec<(u8, &str)> = events
            .iter()
            .filter_map(|e| match e {
                PresentationEvent::Progress { percent, label, .. } => Some((*percent, label.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            shown,
            vec![(100, "Loading config.json: 100%"), (12, "Loading model.safetensors: 12%")]
        );
    }

    #[test]
    fn test_display_percent() {
        assert_eq!(display_percent(49.6), 50);
        assert_eq!(display_percent(-3.0), 0);
        assert_eq!(display_percent(100.4), 100);
        assert_eq!(display_percent(f32::NAN), 0);
    }

    #[test]
    fn test_snapshot_failure_supersedes_partials() {
        let mut snapshot = SessionSnapshot::default();
        snapshot.apply(&PresentationEvent::Partial { text: "half a".into() });
        snapshot.apply(&PresentationEvent::Partial { text: " sentence".into() });
        assert_eq!(snapshot.partial, "half a sentence");

        snapshot.apply(&PresentationEvent::Failure {
            kind: "transcription".into(),
            message: "Transcription failed: boom".into(),
        });
        assert!(snapshot.partial.is_empty());
        assert_eq!(snapshot.failed_jobs, 1);
    }

    #[test]
    fn test_job_settings_from_config() {
        let settings = JobSettings::from_config(&AppConfig::default()).unwrap();
        assert_eq!(settings.fingerprint.model_id, "openai/whisper-tiny");
        assert_eq!(settings.fingerprint.device, ComputeDevice::Portable);
        assert_eq!(settings.fingerprint.precision, Precision::Full);
        assert_eq!(settings.language, "auto");
        assert!(!settings.timestamps);
    }
}
