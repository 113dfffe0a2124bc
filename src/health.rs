//! # Health & Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a summary of the session
//! - `GET /api/v1/metrics`: per-endpoint request statistics

use crate::controller::{JobSettings, SessionPhase, SessionSnapshot};
use crate::device::DeviceManager;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let snapshot = state.session.snapshot();

    let default_engine = match JobSettings::from_config(&config) {
        Ok(settings) => json!(settings.fingerprint),
        Err(e) => json!({ "error": e.to_string() }),
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "websocket_clients": metrics.websocket_clients
        },
        "memory": get_memory_info(),
        "session": session_status(&snapshot),
        "engine": {
            "default": default_engine,
            "devices": DeviceManager::summary()
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();
    let snapshot = state.session.snapshot();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "websocket_clients": metrics.websocket_clients,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "jobs": {
            "completed": snapshot.completed_jobs,
            "failed": snapshot.failed_jobs,
            "busy": snapshot.busy
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "channel_capacity": config.performance.channel_capacity,
            "max_upload_mb": config.performance.max_upload_mb,
            "max_websocket_clients": config.performance.max_websocket_clients
        }
    }))
}

/// Coarse status of the transcription session for health probes.
fn session_status(snapshot: &SessionSnapshot) -> serde_json::Value {
    let status = match snapshot.phase {
        SessionPhase::Idle | SessionPhase::Done => "idle",
        SessionPhase::Failed => "last_job_failed",
        SessionPhase::Decoding | SessionPhase::AwaitingEngine | SessionPhase::Transcribing => "busy",
    };

    json!({
        "status": status,
        "phase": snapshot.phase,
        "busy": snapshot.busy,
        "completed_jobs": snapshot.completed_jobs,
        "failed_jobs": snapshot.failed_jobs
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    let _ = process::id();

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::scripted_state;
    use crate::transcription::engine::testing::ScriptedOutcome;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_session_and_engine() {
        let state = scripted_state(AppConfig::default(), ScriptedOutcome::Echo(String::new()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["session"]["status"], "idle");
        assert_eq!(body["session"]["phase"], "idle");
        assert_eq!(body["engine"]["default"]["model_id"], "openai/whisper-tiny");
        assert_eq!(body["engine"]["default"]["device"], "portable");
        assert_eq!(body["engine"]["devices"]["portable_available"], true);
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints() {
        let state = scripted_state(AppConfig::default(), ScriptedOutcome::Echo(String::new()));
        state.record_endpoint_request("GET /health", 4, false);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
        assert_eq!(body["jobs"]["completed"], 0);
        assert_eq!(body["performance"]["channel_capacity"], 32);
    }
}
