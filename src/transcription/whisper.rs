//! # Whisper Engine (Candle)
//!
//! The production [`EngineLoader`] and [`SpeechEngine`] backed by Whisper models
//! running on Candle-rs.
//!
//! ## Model Loading Process:
//! 1. Resolve the compute device (CPU, or CUDA/Metal for accelerated)
//! 2. Download config, tokenizer and weights from HuggingFace (cached locally)
//! 3. Build the model from safetensors (full precision) or GGUF (quantized)
//!
//! ## Weight Sources:
//! - **full**: `config.json`, `tokenizer.json`, `model.safetensors` from the model repo itself
//! - **quantized**: `config-{size}.json`, `tokenizer-{size}.json`, `model-{size}-q80.gguf`
//!   from `lmz/candle-whisper`, where `openai/whisper-tiny.en` has size `tiny-en`
//!
//! ## Inference:
//! Each chunk window is converted to an 80/128-bin log-mel spectrogram, encoded
//! once, then decoded greedily with timestamp tokens enabled. Timestamp tokens
//! split the output into segments; only segments whose midpoint falls in the
//! window's owned region are kept, so overlapping windows never duplicate text.

use crate::device::DeviceManager;
use crate::transcription::chunking::Window;
use crate::transcription::engine::{EngineLoader, PartialSink, ProgressSink, RunOptions, SpeechEngine};
use crate::transcription::fingerprint::{Fingerprint, Precision};
use crate::transcription::result::{Segment, TranscriptionResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use std::path::PathBuf;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Repository hosting the GGUF quantized Whisper weights.
const QUANTIZED_REPO: &str = "lmz/candle-whisper";

/// Seconds per timestamp token step.
const TIME_PRECISION: f64 = 0.02;

/// Whisper language codes, in token order.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it", "id", "hi", "fi",
    "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur", "hr", "bg", "lt", "la", "mi", "ml",
    "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs",
    "kk", "sq", "sw", "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am",
    "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln",
    "ha", "ba", "jw", "su",
];

/// Files needed to build one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub repo: String,
    pub config: String,
    pub tokenizer: String,
    pub weights: String,
}

impl ModelFiles {
    pub fn for_fingerprint(fingerprint: &Fingerprint) -> Self {
        match fingerprint.precision {
            Precision::Full => Self {
                repo: fingerprint.model_id.clone(),
                config: "config.json".to_string(),
                tokenizer: "tokenizer.json".to_string(),
                weights: "model.safetensors".to_string(),
            },
            Precision::Quantized => {
                let size = quantized_size(&fingerprint.model_id);
                Self {
                    repo: QUANTIZED_REPO.to_string(),
                    config: format!("config-{}.json", size),
                    tokenizer: format!("tokenizer-{}.json", size),
                    weights: format!("model-{}-q80.gguf", size),
                }
            }
        }
    }
}

/// `openai/whisper-tiny.en` → `tiny-en`
fn quantized_size(model_id: &str) -> String {
    let name = model_id.rsplit('/').next().unwrap_or(model_id);
    name.trim_start_matches("whisper-").replace('.', "-")
}

/// English-only checkpoints carry no language tokens in their prompt.
pub fn is_multilingual(model_id: &str) -> bool {
    !model_id.ends_with(".en")
}

/// Loads Whisper models from the HuggingFace Hub.
#[derive(Debug, Default, Clone)]
pub struct WhisperLoader;

impl WhisperLoader {
    pub fn new() -> Self {
        Self
    }

    /// Create the HuggingFace API client honouring `HF_TOKEN`, `HF_HUB_CACHE` and `HF_HOME`.
    fn build_api() -> Result<Api> {
        let mut builder = ApiBuilder::new().with_token(std::env::var("HF_TOKEN").ok());

        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            debug!("Using custom cache dir: {}", cache_dir);
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            let cache_path = PathBuf::from(hf_home).join("hub");
            debug!("Using cache dir from HF_HOME: {:?}", cache_path);
            builder = builder.with_cache_dir(cache_path);
        }

        builder
            .with_progress(false)
            .build()
            .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))
    }

    /// Download one file, reporting it as 0% before and 100% once it is on disk.
    async fn fetch(repo: &ApiRepo, repo_id: &str, file: &str, progress: &ProgressSink) -> Result<PathBuf> {
        progress.report(file, 0.0);
        let path = repo
            .get(file)
            .await
            .map_err(|e| anyhow!("Failed to download {} from {}: {}", file, repo_id, e))?;
        debug!("Fetched {} to {:?}", file, path);
        progress.report(file, 100.0);
        Ok(path)
    }
}

#[async_trait]
impl EngineLoader for WhisperLoader {
    async fn load(&self, fingerprint: &Fingerprint, progress: ProgressSink) -> Result<Box<dyn SpeechEngine>> {
        info!("Loading Whisper model {}", fingerprint);
        let start_time = Instant::now();

        let device = DeviceManager::resolve(fingerprint.device)?;
        let files = ModelFiles::for_fingerprint(fingerprint);

        let api = Self::build_api()?;
        let repo = api.model(files.repo.clone());
        let config_path = Self::fetch(&repo, &files.repo, &files.config, &progress).await?;
        let tokenizer_path = Self::fetch(&repo, &files.repo, &files.tokenizer, &progress).await?;
        let weights_path = Self::fetch(&repo, &files.repo, &files.weights, &progress).await?;

        let fingerprint = fingerprint.clone();
        let engine = tokio::task::spawn_blocking(move || {
            WhisperEngine::build(fingerprint, device, config_path, tokenizer_path, weights_path)
        })
        .await
        .map_err(|e| anyhow!("Model initialization task failed: {}", e))??;

        info!(
            "Whisper model ready on {} in {:.2}s",
            DeviceManager::describe(&engine.device),
            start_time.elapsed().as_secs_f64()
        );
        Ok(Box::new(engine))
    }
}

/// Full-precision or quantized Whisper network.
enum Model {
    Normal(m::model::Whisper),
    Quantized(m::quantized_model::Whisper),
}

impl Model {
    fn config(&self) -> &Config {
        match self {
            Model::Normal(m) => &m.config,
            Model::Quantized(m) => &m.config,
        }
    }

    fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.encoder.forward(x, flush),
            Model::Quantized(m) => m.encoder.forward(x, flush),
        }
    }

    fn decoder_forward(&mut self, x: &Tensor, xa: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.decoder.forward(x, xa, flush),
            Model::Quantized(m) => m.decoder.forward(x, xa, flush),
        }
    }

    fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.decoder.final_linear(x),
            Model::Quantized(m) => m.decoder.final_linear(x),
        }
    }
}

/// Special token ids looked up from the tokenizer.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    eot: u32,
    no_timestamps: u32,
}

impl SpecialTokens {
    fn timestamp_begin(&self) -> u32 {
        self.no_timestamps + 1
    }
}

/// A decoded span relative to its window start.
#[derive(Debug, Clone, PartialEq)]
struct TokenSpan {
    start: f64,
    end: f64,
    tokens: Vec<u32>,
}

/// A loaded Whisper model ready for transcription.
pub struct WhisperEngine {
    fingerprint: Fingerprint,
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
    /// `-inf` on every suppressed vocabulary entry, `0` elsewhere
    suppress: Tensor,
}

impl WhisperEngine {
    fn build(
        fingerprint: Fingerprint,
        device: Device,
        config_path: PathBuf,
        tokenizer_path: PathBuf,
        weights_path: PathBuf,
    ) -> Result<Self> {
        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        debug!("Model config: {:?}", config);

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let model = match fingerprint.precision {
            Precision::Full => {
                let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)? };
                Model::Normal(m::model::Whisper::load(&vb, config.clone())?)
            }
            Precision::Quantized => {
                let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(&weights_path, &device)?;
                Model::Quantized(m::quantized_model::Whisper::load(&vb, config.clone())?)
            }
        };

        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
        };

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) || i == tokens.no_timestamps {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;

        Ok(Self {
            mel_filters: mel_filter_bank(config.num_mel_bins),
            fingerprint,
            model,
            tokenizer,
            device,
            tokens,
            suppress,
        })
    }

    /// Log-mel spectrogram of one window, shaped `(1, n_mels, <=3000)`.
    fn mel(&self, pcm: &[f32]) -> Result<Tensor> {
        let config = self.model.config();
        let mel = m::audio::pcm_to_mel(config, pcm, &self.mel_filters);
        let n_mels = config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?)
    }

    /// Language token for an explicit choice, `None` when detection is needed or impossible.
    fn requested_language(&self, language: Option<&str>) -> Result<Option<u32>> {
        if !is_multilingual(&self.fingerprint.model_id) {
            return Ok(None);
        }
        match language {
            Some(code) => self
                .tokenizer
                .token_to_id(&format!("<|{}|>", code))
                .map(Some)
                .ok_or_else(|| anyhow!("Unsupported language: {}", code)),
            None => Ok(None),
        }
    }

    fn detect_language(&mut self, mel: &Tensor) -> Result<u32> {
        let candidates: Vec<(u32, &str)> = LANGUAGES
            .iter()
            .filter_map(|code| self.tokenizer.token_to_id(&format!("<|{}|>", code)).map(|id| (id, *code)))
            .collect();
        if candidates.is_empty() {
            return Err(anyhow!("Model has no language tokens"));
        }
        let ids: Vec<u32> = candidates.iter().map(|(id, _)| *id).collect();

        let audio_features = self.model.encoder_forward(mel, true)?;
        let tokens = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = self.model.decoder_forward(&tokens, &audio_features, true)?;
        let logits = self.model.decoder_final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
        let logits = logits.index_select(&Tensor::new(ids.as_slice(), &self.device)?, 0)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1::<f32>()?;

        let best = argmax(&probs);
        let (id, code) = candidates[best as usize];
        info!("Detected language '{}' (p={:.2})", code, probs[best as usize]);
        Ok(id)
    }

    /// Greedy decode of one window.
    fn decode_window(&mut self, mel: &Tensor, language: Option<u32>, duration: f64) -> Result<Vec<TokenSpan>> {
        let audio_features = self.model.encoder_forward(mel, true)?;
        let max_positions = self.model.config().max_target_positions;
        let sample_len = max_positions / 2;

        let mut tokens = vec![self.tokens.sot];
        if let Some(language) = language {
            tokens.push(language);
        }
        tokens.push(self.tokens.transcribe);
        let prompt_len = tokens.len();

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder_forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder_final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress)?;
            let next_token = argmax(&logits.to_vec1::<f32>()?);

            tokens.push(next_token);
            if next_token == self.tokens.eot || tokens.len() > max_positions {
                break;
            }
        }

        Ok(split_spans(&tokens[prompt_len..], &self.tokens, duration))
    }

    fn decode_text(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))
    }

    fn transcribe_window(
        &mut self,
        samples: &[f32],
        window: &Window,
        language: Option<u32>,
        sample_rate: u32,
    ) -> Result<Vec<Segment>> {
        let pcm = &samples[window.start..window.end];
        let mel = self.mel(pcm)?;
        let duration = window.len() as f64 / sample_rate as f64;
        let offset = window.offset_seconds(sample_rate);

        let mut segments = Vec::new();
        for span in self.decode_window(&mel, language, duration)? {
            let (start, end) = (offset + span.start, offset + span.end);
            if !window.owns(start, end, sample_rate) {
                continue;
            }
            let text = self.decode_text(&span.tokens)?;
            if !text.trim().is_empty() {
                segments.push(Segment::new(start, end, text));
            }
        }
        Ok(segments)
    }
}

impl SpeechEngine for WhisperEngine {
    fn run(&mut self, samples: &[f32], options: &RunOptions, partials: &PartialSink) -> Result<TranscriptionResult> {
        let start_time = Instant::now();
        let sample_rate = m::SAMPLE_RATE as u32;
        let windows = options.chunking.plan(samples.len(), sample_rate);
        let mut language = self.requested_language(options.language.as_deref())?;
        let detect = is_multilingual(&self.fingerprint.model_id) && language.is_none();

        let mut segments = Vec::new();
        for (index, window) in windows.iter().enumerate() {
            if window.is_empty() {
                continue;
            }
            if detect && language.is_none() {
                let mel = self.mel(&samples[window.start..window.end])?;
                language = Some(self.detect_language(&mel)?);
            }

            let window_segments = self.transcribe_window(samples, window, language, sample_rate)?;
            debug!(
                "Window {}/{} produced {} segment(s)",
                index + 1,
                windows.len(),
                window_segments.len()
            );

            if partials.is_enabled() && !window_segments.is_empty() {
                let text: Vec<&str> = window_segments.iter().map(|s| s.text.trim()).collect();
                partials.send(text.join(" "));
            }
            segments.extend(window_segments);
        }

        debug!(
            "Transcribed {:.2}s of audio in {:.2}s",
            samples.len() as f64 / sample_rate as f64,
            start_time.elapsed().as_secs_f64()
        );

        if options.return_timestamps {
            Ok(TranscriptionResult::SegmentList(segments))
        } else {
            let text: Vec<&str> = segments.iter().map(|s| s.text.trim()).collect();
            Ok(TranscriptionResult::PlainText(text.join(" ")))
        }
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("No token id for {}", token))
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Split decoded tokens into spans at timestamp tokens.
///
/// Text before the first timestamp starts at 0; text after the last one runs
/// to `duration`. Special tokens other than timestamps are dropped.
fn split_spans(tokens: &[u32], special: &SpecialTokens, duration: f64) -> Vec<TokenSpan> {
    let timestamp_begin = special.timestamp_begin();
    let mut spans = Vec::new();
    let mut start: Option<f64> = None;
    let mut text = Vec::new();

    for &token in tokens {
        if token == special.eot {
            break;
        }
        if token >= timestamp_begin {
            let time = (token - timestamp_begin) as f64 * TIME_PRECISION;
            if !text.is_empty() {
                spans.push(TokenSpan {
                    start: start.unwrap_or(0.0),
                    end: time,
                    tokens: std::mem::take(&mut text),
                });
            }
            start = Some(time);
        } else if token < special.eot {
            text.push(token);
        }
    }

    if !text.is_empty() {
        spans.push(TokenSpan {
            start: start.unwrap_or(0.0),
            end: duration,
            tokens: text,
        });
    }
    spans
}

/// Slaney-style mel filter bank laid out `(n_mels, N_FFT / 2 + 1)` row-major.
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    let n_fft = m::N_FFT;
    let n_freq = n_fft / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f64;

    let mel_max = hz_to_mel(sample_rate / 2.0);
    let hz_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freq];
    for mel in 0..n_mels {
        let (left, center, right) = (hz_points[mel], hz_points[mel + 1], hz_points[mel + 2]);
        let enorm = 2.0 / (right - left);

        for k in 0..n_freq {
            let freq = k as f64 * sample_rate / n_fft as f64;
            let weight = if freq >= left && freq <= center && center > left {
                (freq - left) / (center - left)
            } else if freq > center && freq <= right && right > center {
                (right - freq) / (right - center)
            } else {
                0.0
            };
            filters[mel * n_freq + k] = (weight * enorm) as f32;
        }
    }
    filters
}

const SLANEY_F_SP: f64 = 200.0 / 3.0;
const SLANEY_MIN_LOG_HZ: f64 = 1000.0;
const SLANEY_MIN_LOG_MEL: f64 = SLANEY_MIN_LOG_HZ / SLANEY_F_SP;

fn slaney_log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < SLANEY_MIN_LOG_HZ {
        hz / SLANEY_F_SP
    } else {
        SLANEY_MIN_LOG_MEL + (hz / SLANEY_MIN_LOG_HZ).ln() / slaney_log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < SLANEY_MIN_LOG_MEL {
        mel * SLANEY_F_SP
    } else {
        SLANEY_MIN_LOG_HZ * ((mel - SLANEY_MIN_LOG_MEL) * slaney_log_step()).exp()
    }
}
