//! HTTP handlers, one module per resource.

pub mod config;
pub mod models;
pub mod session;
pub mod transcribe;

pub use config::*;
pub use models::*;
pub use session::*;
pub use transcribe::*;

use crate::error::{AppError, AppResult};
use actix_web::{HttpRequest, HttpResponse};

/// Fallback for unknown routes, so clients always get the JSON error shape.
pub async fn not_found(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}
