//! # Session Event WebSocket
//!
//! `/ws/session` is the live view of the transcription session. Each client
//! gets the current [`SessionSnapshot`] on connect, then every
//! [`PresentationEvent`] as it is published, in publication order.
//!
//! ## Message Format:
//! - **Server → Client**: presentation events as they serialize
//!   (`{"type": "progress", "file": ..., "percent": 42, "label": ...}`), plus
//!   `snapshot`, `ping`, `pong` and `error` frames
//! - **Client → Server**: `{"type": "snapshot"}` to request a fresh snapshot,
//!   `{"type": "ping", "timestamp": ...}` for latency checks
//!
//! ## Heartbeat:
//! The server pings every 30 seconds and closes the socket when nothing has
//! been heard from the client for 60 seconds.
//!
//! Clients that fall behind the broadcast buffer receive a fresh snapshot in
//! place of the events they missed.

use crate::controller::{PresentationEvent, SessionSnapshot};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames the server sends besides presentation events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot { snapshot: SessionSnapshot },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
    Error { code: String, message: String },
}

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Snapshot,
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

/// One connected client.
pub struct SessionSocket {
    client_id: Uuid,
    state: web::Data<AppState>,
    /// Taken when the actor starts
    updates: Option<broadcast::Receiver<PresentationEvent>>,
    last_heartbeat: Instant,
}

impl SessionSocket {
    /// Subscribes immediately so nothing published between the snapshot and
    /// the start of the stream is lost.
    pub fn new(state: web::Data<AppState>) -> Self {
        let updates = state.session.subscribe();
        Self {
            client_id: Uuid::new_v4(),
            state,
            updates: Some(updates),
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(client_id = %self.client_id, "Failed to serialize WebSocket frame: {}", e),
        }
    }

    fn send_snapshot(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let snapshot = self.state.session.snapshot();
        self.send(ctx, &ServerMessage::Snapshot { snapshot });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Snapshot) => self.send_snapshot(ctx),
            Ok(ClientMessage::Ping { timestamp }) => self.send(ctx, &ServerMessage::Pong { timestamp }),
            Ok(ClientMessage::Pong { timestamp }) => {
                debug!(
                    client_id = %self.client_id,
                    latency_ms = chrono::Utc::now().timestamp_millis() - timestamp,
                    "Heartbeat answered"
                );
            }
            Err(e) => self.send(
                ctx,
                &ServerMessage::Error {
                    code: "invalid_message".to_string(),
                    message: format!("Invalid JSON: {}", e),
                },
            ),
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Session WebSocket connected");

        self.send_snapshot(ctx);
        if let Some(updates) = self.updates.take() {
            ctx.add_stream(BroadcastStream::new(updates));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = %act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis();
            act.send(ctx, &ServerMessage::Ping { timestamp });
            ctx.ping(timestamp.to_string().as_bytes());
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.remove_websocket_client();
        info!(client_id = %self.client_id, "Session WebSocket disconnected");
    }
}

/// Presentation events fanned out from the controller.
impl StreamHandler<Result<PresentationEvent, BroadcastStreamRecvError>> for SessionSocket {
    fn handle(&mut self, item: Result<PresentationEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => ctx.text(json),
                Err(e) => error!(client_id = %self.client_id, "Failed to serialize presentation event: {}", e),
            },
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(client_id = %self.client_id, missed, "WebSocket client fell behind, resending snapshot");
                self.send_snapshot(ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Session stopped publishing, closing WebSocket");
        ctx.close(Some(ws::CloseCode::Away.into()));
        ctx.stop();
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.send(
                    ctx,
                    &ServerMessage::Error {
                        code: "unsupported".to_string(),
                        message: "Upload audio with POST /api/v1/transcriptions".to_string(),
                    },
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(client_id = %self.client_id, ?reason, "WebSocket close requested");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade to a session WebSocket.
///
/// ## Endpoint: `GET /ws/session`
///
/// ## Returns:
/// - **101**: Upgraded, the snapshot follows immediately
/// - **503**: `performance.max_websocket_clients` clients are already connected
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    if !state.try_add_websocket_client() {
        warn!("WebSocket connection refused, client limit reached");
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "too_many_clients",
                "message": "Too many WebSocket clients connected",
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }

    debug!(peer = ?req.connection_info().peer_addr(), "WebSocket upgrade requested");
    let result = ws::start(SessionSocket::new(state.clone()), &req, stream);
    if result.is_err() {
        // The actor never started, so `stopped` will not release the slot.
        state.remove_websocket_client();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::controller::SessionPhase;
    use crate::state::testing::scripted_state;
    use crate::transcription::engine::testing::ScriptedOutcome;
    use actix_web::{test as actix_test, App};

    #[test]
    fn test_server_frames() {
        let snapshot = ServerMessage::Snapshot {
            snapshot: SessionSnapshot::default(),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["snapshot"]["phase"], "idle");

        let event = serde_json::to_value(PresentationEvent::Phase {
            phase: SessionPhase::Decoding,
            busy: true,
        })
        .unwrap();
        assert_eq!(event, json!({"type": "phase", "phase": "decoding", "busy": true}));
    }

    #[test]
    fn test_client_frames() {
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"snapshot"}"#).unwrap(),
            ClientMessage::Snapshot
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping","timestamp":5}"#).unwrap(),
            ClientMessage::Ping { timestamp: 5 }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"start_session"}"#).is_err());
    }

    #[actix_web::test]
    async fn test_client_limit_refuses_upgrade() {
        let mut config = AppConfig::default();
        config.performance.max_websocket_clients = 1;
        let state = web::Data::new(scripted_state(config, ScriptedOutcome::Echo(String::new())));
        assert!(state.try_add_websocket_client());

        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/session", web::get().to(session_websocket)),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ws/session").to_request()).await;
        assert_eq!(resp.status().as_u16(), 503);
        assert_eq!(state.get_metrics_snapshot().websocket_clients, 1);
    }

    #[actix_web::test]
    async fn test_failed_handshake_releases_slot() {
        let state = web::Data::new(scripted_state(AppConfig::default(), ScriptedOutcome::Echo(String::new())));
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/session", web::get().to(session_websocket)),
        )
        .await;

        // No upgrade headers, so the handshake fails.
        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ws/session").to_request()).await;
        assert!(resp.status().is_client_error());
        assert_eq!(state.get_metrics_snapshot().websocket_clients, 0);
    }
}
