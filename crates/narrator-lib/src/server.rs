//! HTTP API for the narrator speech server.
//!
//! Runs on port 5555 by default (`TTS_PORT`). CORS-permissive so local
//! tooling can call it from a browser.
//!
//! | Route | Body | Response |
//! |---|---|---|
//! | `GET /health` | — | [`HealthStatus`] |
//! | `POST /generate` | [`SynthesisItem`] | [`GenerateResponse`] |
//! | `POST /batch` | [`BatchRequest`] | [`BatchResponse`] |
//! | `POST /batch-stream` | [`BatchRequest`] | `text/event-stream` of [`ProgressEvent`] |
//!
//! [`SynthesisItem`]: narrator_core::types::SynthesisItem
//! [`ProgressEvent`]: narrator_core::types::ProgressEvent

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use narrator_core::Error;
use narrator_core::types::{
    BatchRequest, BatchResponse, ErrorResponse, GenerateRequest, GenerateResponse, HealthStatus,
    ProgressEvent,
};

use crate::service::TtsService;
use crate::shutdown::{ShutdownHook, ShutdownSignal};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 5555;

/// How long in-flight requests may run after a shutdown signal.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the axum router with a shared [`TtsService`].
pub fn router(service: TtsService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/batch", post(batch))
        .route("/batch-stream", post(batch_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve until `signal` fires, releasing the model as soon as it does.
///
/// Pass the [`ShutdownSignal`] armed before the preload so a signal during
/// startup is not lost.
pub async fn serve(
    listener: TcpListener,
    service: TtsService,
    hook: Arc<ShutdownHook>,
    signal: ShutdownSignal,
    drain_timeout: Duration,
) -> std::io::Result<()> {
    serve_with_shutdown(listener, service, hook, signal.fired(), drain_timeout).await
}

/// Like [`serve`], with a caller-supplied shutdown trigger.
///
/// When `signal` resolves the hook releases the model immediately, then the
/// listener stops accepting and in-flight requests get `drain_timeout` to
/// finish before the server is dropped.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    service: TtsService,
    hook: Arc<ShutdownHook>,
    signal: impl Future<Output = ()> + Send + 'static,
    drain_timeout: Duration,
) -> std::io::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);

    let signal_hook = hook.clone();
    tokio::spawn(async move {
        signal.await;
        signal_hook.shutdown();
        let _ = stop_tx.send(true);
    });

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, device = %service.device(), "narrator listening");
    }

    let mut graceful_rx = stop_rx.clone();
    let server = async move {
        axum::serve(listener, router(service))
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.wait_for(|stop| *stop).await;
            })
            .await
    };

    let mut deadline_rx = stop_rx;
    let deadline = async move {
        let stopped = deadline_rx.wait_for(|stop| *stop).await.is_ok();
        if stopped {
            tokio::time::sleep(drain_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    let result = tokio::select! {
        res = server => res,
        _ = deadline => {
            warn!(?drain_timeout, "drain timeout, dropping open connections");
            Ok(())
        }
    };

    hook.shutdown();
    info!("server stopped");
    result
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Handler error rendered as `{"error": ...}` with the taxonomy's status.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(service): State<TtsService>) -> Json<HealthStatus> {
    Json(service.health())
}

async fn generate(
    State(service): State<TtsService>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(item) = payload?;
    Ok(Json(service.generate(item).await?))
}

async fn batch(
    State(service): State<TtsService>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(service.batch(req.items).await?))
}

async fn batch_stream(
    State(service): State<TtsService>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Json(req) = payload?;
    let rx = service.batch_stream(req.items).await?;
    let events = ReceiverStream::new(rx).map(|event| Ok(sse_frame(&event)));
    Ok(Sse::new(events))
}

/// One `data: <json>` frame.
fn sse_frame(event: &ProgressEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => Event::default().data(
            serde_json::json!({ "type": "error", "message": e.to_string() }).to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_statuses() {
        let resp = ApiError(Error::validation("No items provided")).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = ApiError(Error::synthesis("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = ApiError(Error::ShuttingDown).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
