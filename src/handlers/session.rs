use crate::state::AppState;
use actix_web::{web, HttpResponse};

/// Current session snapshot.
///
/// ## Endpoint: `GET /api/v1/session`
///
/// Polling alternative to `/ws/session` for clients that cannot hold a socket.
pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.session.snapshot())
}
