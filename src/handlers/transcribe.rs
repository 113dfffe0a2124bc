//! # Transcription Upload Endpoint
//!
//! `POST /api/v1/transcriptions` is the acquisition layer: it turns a multipart
//! upload into an [`UploadedFile`] plus [`JobSettings`] and hands both to the
//! session controller. The handler never waits for the transcription itself;
//! progress and output arrive on `/ws/session` and `GET /api/v1/session`.
//!
//! ## Form Fields:
//! - `audio` (required): the file
//! - `model`, `device`, `precision`, `language`, `timestamps` (optional):
//!   override the configured defaults for this job only
//!
//! ## Responses:
//! - `202 {"accepted": true, "job_id": ...}`: job admitted
//! - `200 {"accepted": false, "reason": "busy"}`: a job is already in flight
//! - `400`: missing file, oversized upload or an invalid override

use crate::config::AppConfig;
use crate::controller::{JobSettings, UploadedFile};
use crate::transcription::fingerprint::{ComputeDevice, Precision};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use tracing::{debug, info};

/// Text fields that may accompany the upload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JobOverrides {
    pub model: Option<String>,
    pub device: Option<String>,
    pub precision: Option<String>,
    pub language: Option<String>,
    pub timestamps: Option<String>,
}

impl JobOverrides {
    fn set(&mut self, name: &str, value: String) -> bool {
        let value = value.trim().to_string();
        let slot = match name {
            "model" => &mut self.model,
            "device" => &mut self.device,
            "precision" => &mut self.precision,
            "language" => &mut self.language,
            "timestamps" => &mut self.timestamps,
            _ => return false,
        };
        if !value.is_empty() {
            *slot = Some(value);
        }
        true
    }

    /// Combine the configured defaults with these overrides.
    ///
    /// ## Returns:
    /// - **Ok(JobSettings)**: Settings for one job
    /// - **Err(AppError::BadRequest)**: An override names an unknown model, device,
    ///   precision or boolean
    pub fn resolve(&self, config: &AppConfig) -> Result<JobSettings, AppError> {
        let mut settings = JobSettings::from_config(config).map_err(|e| AppError::ConfigError(e.to_string()))?;

        if let Some(model) = &self.model {
            if !config.models.available.iter().any(|m| m == model) {
                return Err(AppError::BadRequest(format!("Unknown model: {}", model)));
            }
            settings.fingerprint.model_id = model.clone();
        }
        if let Some(device) = &self.device {
            settings.fingerprint.device = device.parse::<ComputeDevice>().map_err(AppError::BadRequest)?;
        }
        if let Some(precision) = &self.precision {
            settings.fingerprint.precision = precision.parse::<Precision>().map_err(AppError::BadRequest)?;
        }
        if let Some(language) = &self.language {
            settings.language = language.to_lowercase();
        }
        if let Some(timestamps) = &self.timestamps {
            settings.timestamps = parse_flag(timestamps)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid timestamps value: {}", timestamps)))?;
        }

        Ok(settings)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Drain one multipart field, failing as soon as it grows past `limit` bytes.
async fn read_field(field: &mut Field, name: &str, limit: usize) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Err(AppError::BadRequest(format!(
                "Field '{}' too large (max: {} bytes)",
                name, limit
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Accept an audio upload and submit it to the session.
///
/// ## Endpoint: `POST /api/v1/transcriptions`
pub async fn submit_transcription(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let limit = config.max_upload_bytes();

    let mut upload: Option<UploadedFile> = None;
    let mut overrides = JobOverrides::default();

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let Some(disposition) = field.content_disposition().cloned() else {
            return Err(AppError::BadRequest("Missing content disposition".to_string()));
        };
        let Some(name) = disposition.get_name().map(str::to_string) else {
            return Err(AppError::BadRequest("Missing field name".to_string()));
        };

        if name == "audio" {
            let file_name = disposition.get_filename().unwrap_or("upload").to_string();
            let bytes = read_field(&mut field, &name, limit).await?;
            upload = Some(UploadedFile { name: file_name, bytes });
        } else {
            let bytes = read_field(&mut field, &name, 1024).await?;
            let value = String::from_utf8(bytes)
                .map_err(|_| AppError::BadRequest(format!("Field '{}' is not valid UTF-8", name)))?;
            if !overrides.set(&name, value) {
                debug!(field = %name, "Ignoring unknown form field");
            }
        }
    }

    let file = upload.ok_or_else(|| AppError::BadRequest("Missing 'audio' file field".to_string()))?;
    let settings = overrides.resolve(&config)?;
    let file_name = file.name.clone();
    let size_bytes = file.bytes.len();

    if !state.session.submit(file, settings.clone()).await? {
        info!(file = %file_name, "Upload not admitted, session busy");
        return Ok(HttpResponse::Ok().json(json!({
            "accepted": false,
            "reason": "busy"
        })));
    }

    // Admission publishes the job id before the controller replies.
    let job_id = state.session.snapshot().job_id;
    Ok(HttpResponse::Accepted().json(json!({
        "accepted": true,
        "job_id": job_id,
        "file_name": file_name,
        "size_bytes": size_bytes,
        "settings": settings
    })))
}
