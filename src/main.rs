//! # Transcription Orchestrator - Main Application Entry Point
//!
//! Starts the Actix-web server in front of a two-task transcription pipeline:
//!
//! ```text
//! HTTP upload ─▶ session controller ──WorkerCommand──▶ inference worker (owns the engine)
//!                        ▲         ◀──WorkerEvent────
//!                        └─▶ presentation events ─▶ /ws/session, GET /api/v1/session
//! ```
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **state**: Shared handler state and request metrics
//! - **controller**: Session state machine, single job at a time
//! - **worker**: Inference worker, keeps one engine alive between jobs
//! - **protocol**: Messages exchanged by the two
//! - **audio** / **transcription**: Decoding, chunking, engines, output rendering
//! - **health**, **handlers**, **websocket**, **middleware**: HTTP surface

mod audio;
mod config;
mod controller;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod state;
mod transcription;
mod websocket;
mod worker;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::audio::decoder::MediaDecoder;
use crate::config::AppConfig;
use crate::state::AppState;
use crate::transcription::chunking::ChunkPolicy;
use crate::transcription::whisper::WhisperLoader;
use crate::worker::{spawn_worker, WorkerSettings};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Starts the inference worker and the session controller**
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.models.default_model,
        device = %config.models.default_device,
        precision = %config.models.default_precision,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let capacity = config.performance.channel_capacity;
    let worker = spawn_worker(
        Arc::new(WhisperLoader::new()),
        WorkerSettings {
            chunking: ChunkPolicy::new(config.transcription.chunk_length_s, config.transcription.stride_length_s),
            emit_partials: config.transcription.emit_partials,
        },
        capacity,
    );
    let (session, session_task) = controller::spawn_session(
        worker.commands,
        worker.events,
        Arc::new(MediaDecoder::new(config.audio.sample_rate)),
        capacity,
    );

    let app_state = web::Data::new(AppState::new(config.clone(), session));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            // Middleware runs in reverse registration order for requests
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .wrap(Cors::permissive())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/models", web::get().to(handlers::list_models))
                    .route("/transcriptions", web::post().to(handlers::submit_transcription))
                    .route("/session", web::get().to(handlers::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/session", web::get().to(websocket::session_websocket))
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Handlers are gone, so nothing submits new jobs; an in-flight job is abandoned.
    session_task.abort();
    worker.handle.abort();

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Log filter, defaults to `transcribe_orchestrator=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_orchestrator=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl+C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
