//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: what an HTTP handler returns; converted into a JSON response
//! - **TranscriptionError** / **DecodeError**: what ends a transcription job
//!
//! ## Job Failure Kinds:
//! - **Decode**: the uploaded file could not be turned into PCM samples (controller side)
//! - **EngineLoad**: the worker could not build an engine for the requested fingerprint
//! - **InferenceRuntime**: the engine failed while transcribing
//!
//! Job errors are never retried. Their `Display` output is exactly what the
//! presentation layer shows to the user.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Missing 'audio' file field",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Malformed or interrupted multipart uploads.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Why an uploaded file could not be decoded into audio samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Zero-byte upload
    Empty,
    /// Recognised container with an encoding we cannot read
    Unsupported(String),
    /// Truncated or malformed data
    Corrupt(String),
    /// Well-formed file without a single sample
    NoSamples,
    /// Conversion to the engine's sample rate failed
    Resample(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "the file is empty"),
            DecodeError::Unsupported(what) => write!(f, "unsupported audio format ({})", what),
            DecodeError::Corrupt(what) => write!(f, "corrupt audio data ({})", what),
            DecodeError::NoSamples => write!(f, "the file contains no audio samples"),
            DecodeError::Resample(what) => write!(f, "could not convert the sample rate ({})", what),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Terminal failure of a transcription job.
///
/// ## Presentation:
/// Decode failures read "Could not read your file: …", everything that went
/// wrong on the worker side reads "Transcription failed: …".
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionError {
    Decode(DecodeError),
    /// Device-aware message produced by the worker
    EngineLoad(String),
    /// Engine message, passed through verbatim
    InferenceRuntime(String),
}

impl TranscriptionError {
    /// Short machine-readable kind for the presentation stream.
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptionError::Decode(_) => "decode",
            TranscriptionError::EngineLoad(_) | TranscriptionError::InferenceRuntime(_) => "transcription",
        }
    }
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptionError::Decode(err) => write!(f, "Could not read your file: {}", err),
            TranscriptionError::EngineLoad(msg) => write!(f, "Transcription failed: {}", msg),
            TranscriptionError::InferenceRuntime(msg) => write!(f, "Transcription failed: {}", msg),
        }
    }
}

impl std::error::Error for TranscriptionError {}

impl From<DecodeError> for TranscriptionError {
    fn from(err: DecodeError) -> Self {
        TranscriptionError::Decode(err)
    }
}
