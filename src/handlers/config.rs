//! # Configuration Endpoints
//!
//! - `GET /api/v1/config`: current configuration
//! - `PUT /api/v1/config`: partial update, e.g. `{"models": {"default_device": "accelerated"}}`

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Apply a partial configuration update.
///
/// The update is applied to a copy and validated before it replaces the live
/// configuration, so a rejected update leaves nothing half-applied.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(updated.clone()).map_err(AppError::ValidationError)?;
    info!(
        model = %updated.models.default_model,
        device = %updated.models.default_device,
        precision = %updated.models.default_precision,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated, new defaults apply to the next job",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::scripted_state;
    use crate::transcription::engine::testing::ScriptedOutcome;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_and_update_config() {
        let state = web::Data::new(scripted_state(AppConfig::default(), ScriptedOutcome::Echo(String::new())));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::get().to(get_config))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["models"]["default_device"], "portable");

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"transcription": {"default_language": "de"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.get_config().transcription.default_language, "de");
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = web::Data::new(scripted_state(AppConfig::default(), ScriptedOutcome::Echo(String::new())));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"models": {"default_device": "tpu"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 400);
        assert_eq!(state.get_config().models.default_device, "portable");
    }
}
