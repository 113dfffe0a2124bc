//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables, nested with `__` (`APP_SERVER__PORT=9000`,
//!    `APP_MODELS__DEFAULT_DEVICE=accelerated`)
//! 3. `config.toml`
//! 4. Defaults
//!
//! ## Runtime Updates:
//! `PUT /api/v1/config` applies a partial JSON document through
//! [`AppConfig::update_from_json`]. New model/device/precision/language
//! defaults take effect for the next submitted job; chunking and channel
//! settings are read once at startup.

use crate::transcription::fingerprint::{ComputeDevice, Precision};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub transcription: TranscriptionConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioConfig,
}

/// Server bind address.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech model defaults.
///
/// ## Fields:
/// - `default_model`: HuggingFace repository id used when an upload names none
/// - `default_device`: `"portable"` (CPU) or `"accelerated"` (CUDA/Metal)
/// - `default_precision`: `"full"` (safetensors) or `"quantized"` (GGUF, tiny models only)
/// - `available`: Model ids offered to clients by `GET /api/v1/models`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_model: String,
    pub default_device: String,
    pub default_precision: String,
    pub available: Vec<String>,
}

/// Inference options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// ISO 639-1 code or `"auto"` for language detection
    pub default_language: String,
    pub return_timestamps: bool,
    pub chunk_length_s: f64,
    pub stride_length_s: f64,
    /// Stream per-window text while a job runs
    pub emit_partials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Bound of the controller/worker channels
    pub channel_capacity: usize,
    pub max_upload_mb: usize,
    pub max_websocket_clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Rate the decoder resamples to; Whisper expects 16000
    pub sample_rate: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                default_model: "openai/whisper-tiny".to_string(),
                default_device: "portable".to_string(),
                default_precision: "full".to_string(),
                available: vec![
                    "openai/whisper-tiny".to_string(),
                    "openai/whisper-tiny.en".to_string(),
                    "openai/whisper-base".to_string(),
                    "openai/whisper-small".to_string(),
                    "openai/whisper-medium".to_string(),
                    "openai/whisper-large-v2".to_string(),
                ],
            },
            transcription: TranscriptionConfig {
                default_language: "auto".to_string(),
                return_timestamps: false,
                chunk_length_s: 30.0,
                stride_length_s: 5.0,
                emit_partials: false,
            },
            performance: PerformanceConfig {
                channel_capacity: 32,
                max_upload_mb: 100,
                max_websocket_clients: 16,
            },
            audio: AudioConfig { sample_rate: 16000 },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.models.default_model.trim().is_empty() {
            return Err(anyhow!("Default model cannot be empty"));
        }
        if !self.models.available.iter().any(|m| *m == self.models.default_model) {
            return Err(anyhow!(
                "Default model {} is not in the available models list",
                self.models.default_model
            ));
        }
        self.models
            .default_device
            .parse::<ComputeDevice>()
            .map_err(|e| anyhow!(e))?;
        self.models
            .default_precision
            .parse::<Precision>()
            .map_err(|e| anyhow!(e))?;

        if self.transcription.default_language.trim().is_empty() {
            return Err(anyhow!("Default language cannot be empty, use \"auto\" for detection"));
        }
        if !(self.transcription.chunk_length_s > 0.0) {
            return Err(anyhow!("Chunk length must be greater than 0"));
        }
        if self.transcription.stride_length_s < 0.0
            || self.transcription.stride_length_s * 2.0 >= self.transcription.chunk_length_s
        {
            return Err(anyhow!("Stride length must be non-negative and less than half the chunk length"));
        }

        if self.performance.channel_capacity == 0 {
            return Err(anyhow!("Channel capacity must be greater than 0"));
        }
        if self.performance.max_upload_mb == 0 {
            return Err(anyhow!("Max upload size must be greater than 0"));
        }
        if self.performance.max_websocket_clients == 0 {
            return Err(anyhow!("Max WebSocket clients must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow!("Audio sample rate cannot be 0"));
        }

        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.performance.max_upload_mb * 1024 * 1024
    }

    /// Apply a partial JSON update, e.g. `{"models": {"default_device": "accelerated"}}`.
    ///
    /// Fields that are absent stay unchanged. The result is validated; on
    /// failure `self` may be partially updated, so callers update a copy.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port).map_err(|_| anyhow!("Port out of range: {}", port))?;
            }
        }

        if let Some(models) = partial_config.get("models") {
            if let Some(model) = models.get("default_model").and_then(|v| v.as_str()) {
                self.models.default_model = model.to_string();
            }
            if let Some(device) = models.get("default_device").and_then(|v| v.as_str()) {
                self.models.default_device = device.to_string();
            }
            if let Some(precision) = models.get("default_precision").and_then(|v| v.as_str()) {
                self.models.default_precision = precision.to_string();
            }
            if let Some(available) = models.get("available") {
                self.models.available = serde_json::from_value(available.clone())?;
            }
        }

        if let Some(transcription) = partial_config.get("transcription") {
            if let Some(language) = transcription.get("default_language").and_then(|v| v.as_str()) {
                self.transcription.default_language = language.to_string();
            }
            if let Some(timestamps) = transcription.get("return_timestamps").and_then(|v| v.as_bool()) {
                self.transcription.return_timestamps = timestamps;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(max_upload) = performance.get("max_upload_mb").and_then(|v| v.as_u64()) {
                self.performance.max_upload_mb = max_upload as usize;
            }
            if let Some(clients) = performance.get("max_websocket_clients").and_then(|v| v.as_u64()) {
                self.performance.max_websocket_clients = clients as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transcription.chunk_length_s, 30.0);
        assert_eq!(config.transcription.stride_length_s, 5.0);
        assert_eq!(config.audio.sample_rate, 16000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.default_device = "tpu".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.default_model = "someone/else".to_string();
        assert!(config.validate().is_err());
        config.models.available.push("someone/else".to_string());
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.transcription.stride_length_s = 15.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"models": {"default_device": "accelerated", "default_precision": "quantized"}, "transcription": {"return_timestamps": true}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.models.default_device, "accelerated");
        assert_eq!(config.models.default_precision, "quantized");
        assert!(config.transcription.return_timestamps);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"models": {"default_precision": "half"}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
        assert!(config
            .update_from_json(r#"{"models": {"available": ["openai/whisper-base"]}}"#)
            .is_err());
    }
}
