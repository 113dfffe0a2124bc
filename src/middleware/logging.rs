//! # Request Logging Middleware
//!
//! One structured `tracing` line when a request arrives and one when it
//! finishes. Every request gets a short id so the two lines (and anything the
//! handler logs in between) can be correlated.
//!
//! ## Levels:
//! - Health probes log at `debug` so polling does not flood the output
//! - 4xx responses log at `warn`, 5xx and transport errors at `error`

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::CONTENT_LENGTH,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

fn is_probe(path: &str) -> bool {
    path == "/health" || path == "/api/v1/health"
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let probe = is_probe(&path);
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let content_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if probe {
            debug!(request_id = %request_id, method = %method, path = %path, "Request received");
        } else {
            info!(
                request_id = %request_id,
                method = %method,
                path = %path,
                remote_addr = %remote_addr,
                content_length,
                "Request received"
            );
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_server_error() {
                        error!(request_id = %request_id, method = %method, path = %path, status, duration_ms, "Request failed");
                    } else if response.status().is_client_error() {
                        warn!(request_id = %request_id, method = %method, path = %path, status, duration_ms, "Request rejected");
                    } else if probe {
                        debug!(request_id = %request_id, status, duration_ms, "Request finished");
                    } else {
                        info!(request_id = %request_id, method = %method, path = %path, status, duration_ms, "Request finished");
                    }
                }
                Err(err) => {
                    error!(
                        request_id = %request_id,
                        method = %method,
                        path = %path,
                        duration_ms,
                        error = %err,
                        "Request errored before a response was built"
                    );
                }
            }

            result
        })
    }
}
