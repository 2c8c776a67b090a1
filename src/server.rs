//! HTTP server exposing the compile service.
//!
//! Routes:
//! - `POST /api/compile`: compile the request body, stream back the PDF
//! - `GET /api/compile`: usage hint (405)
//! - `OPTIONS /api/compile`: preflight (204)
//! - `GET /health`: liveness plus warmup status
//!
//! Bodies above [`MAX_BODY_BYTES`] are refused with 413 before the
//! handler runs.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::{
    attempt::{CompileArtifact, CompileRequest, CompileService},
    error::CompileError,
    warmup,
};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CompileService>,
}

/// Builds the service router. Standalone so tests can drive it without a
/// listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/compile",
            post(compile).get(compile_usage).options(compile_preflight),
        )
        .route("/health", get(health))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Running HTTP server bound to a local address.
pub struct CompileServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl CompileServer {
    /// Binds the listener and starts serving in a background task.
    pub async fn start(addr: SocketAddr, service: Arc<CompileService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind compile server to {addr}"))?;
        let addr = listener
            .local_addr()
            .context("failed to get compile server local address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = AppState { service };
        let handle = tokio::spawn(run_server(listener, state, shutdown_rx));
        info!(%addr, "compile server listening");

        Ok(Self {
            addr,
            shutdown_tx,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals shutdown and waits for in-flight connections to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

async fn run_server(listener: TcpListener, state: AppState, shutdown_rx: oneshot::Receiver<()>) {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
}

async fn compile(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let span = info_span!("attempt", id = %Uuid::new_v4());
    span.in_scope(|| {
        info!(
            body_bytes = body.len(),
            content_type = content_type.as_deref().unwrap_or(""),
            "compile request received"
        );
    });

    let request = CompileRequest {
        body: body.to_vec(),
        content_type,
    };
    let service = Arc::clone(&state.service);
    // Detached task: a client disconnect drops this handler future, but
    // the attempt still runs to completion and releases its workspace.
    let attempt =
        tokio::spawn(async move { service.compile(request).await }.instrument(span.clone()));
    let outcome = attempt.await;
    let _span = span.entered();
    match outcome {
        Ok(Ok(artifact)) => pdf_response(artifact),
        Ok(Err(err)) => err.into_response(),
        Err(err) => {
            error!(%err, "compile task aborted unexpectedly");
            CompileError::Internal {
                detail: err.to_string(),
            }
            .into_response()
        }
    }
}

fn pdf_response(artifact: CompileArtifact) -> Response {
    let len = artifact.len();
    info!(bytes = len, "compile request succeeded");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "inline; filename=\"output.pdf\"".to_string(),
            ),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        artifact.into_bytes(),
    )
        .into_response()
}

#[derive(Serialize)]
struct UsageResponse {
    message: &'static str,
}

async fn compile_usage() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, OPTIONS")],
        Json(UsageResponse {
            message: "Use POST with Content-Type: text/plain to compile LaTeX.",
        }),
    )
        .into_response()
}

async fn compile_preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
    warmup: warmup::WarmupStatus,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "galley",
        timestamp: chrono::Utc::now().to_rfc3339(),
        warmup: warmup::status(),
    })
}

#[derive(Serialize)]
struct NotFoundResponse {
    error: &'static str,
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            error: "Route not found",
        }),
    )
        .into_response()
}
