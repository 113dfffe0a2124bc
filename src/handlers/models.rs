//! # Model Catalogue Endpoint
//!
//! `GET /api/v1/models` tells a client what it may put in the `model`,
//! `device` and `precision` fields of an upload, which engine the next job
//! will use by default, and which engine the worker currently holds.
//!
//! The worker owns the engine, so there is no load/unload endpoint: an engine
//! is loaded on demand by the first job that asks for its fingerprint.

use crate::controller::JobSettings;
use crate::device::DeviceManager;
use crate::transcription::fingerprint::{ComputeDevice, Fingerprint, Precision};
use crate::transcription::whisper::{is_multilingual, ModelFiles};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// One entry of the catalogue.
#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub model_id: String,
    /// Accepts a language hint and supports detection
    pub multilingual: bool,
    /// Weight file fetched for each precision
    pub full_weights: String,
    pub quantized_weights: String,
    /// The worker holds this model right now (any device or precision)
    pub loaded: bool,
}

impl ModelInfoResponse {
    fn new(model_id: &str, loaded: Option<&Fingerprint>) -> Self {
        let files = |precision| {
            ModelFiles::for_fingerprint(&Fingerprint::new(model_id, ComputeDevice::Portable, precision)).weights
        };
        Self {
            model_id: model_id.to_string(),
            multilingual: is_multilingual(model_id),
            full_weights: files(Precision::Full),
            quantized_weights: files(Precision::Quantized),
            loaded: loaded.is_some_and(|f| f.model_id == model_id),
        }
    }
}

/// List the configured models.
///
/// ## Endpoint: `GET /api/v1/models`
///
/// ## Response:
/// ```json
/// {
///   "models": [{ "model_id": "openai/whisper-tiny", "multilingual": true, "loaded": false, ... }],
///   "default": { "model_id": "openai/whisper-tiny", "device": "portable", "precision": "full" },
///   "loaded": null,
///   "devices": { "portable_available": true, "accelerated_available": false, "accelerator": null }
/// }
/// ```
pub async fn list_models(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let loaded = state.session.snapshot().engine;
    let defaults = JobSettings::from_config(&config).map_err(|e| AppError::ConfigError(e.to_string()))?;

    let models: Vec<ModelInfoResponse> = config
        .models
        .available
        .iter()
        .map(|model_id| ModelInfoResponse::new(model_id, loaded.as_ref()))
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "models": models,
        "default": defaults.fingerprint,
        "loaded": loaded,
        "devices": DeviceManager::summary(),
        "precisions": ["full", "quantized"]
    })))
}
