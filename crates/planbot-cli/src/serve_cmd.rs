//! Webhook HTTP server.
//!
//! Exposes the callback surface remote channels post into:
//! `POST /approve`, `POST /respond`, and `GET /health`. With a shared secret
//! configured, every non-health request must carry an `X-Planbot-Signature`
//! HMAC over the raw body; missing or invalid signatures get 401. Handlers
//! feed the multiplexer's [`ResponseRouter`] directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use planbot_core::provider::{ApprovalResponse, QuestionResponse, ResponseRouter};

use crate::signature::{SIGNATURE_HEADER, verify};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveBody {
    plan_id: String,
    approved: bool,
    rejection_reason: Option<String>,
    responded_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondBody {
    question_id: String,
    answer: String,
    responded_by: Option<String>,
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

pub struct ServeState {
    pub router: Arc<ResponseRouter>,
    pub secret: Option<Vec<u8>>,
    pub started_at: Instant,
}

/// Refuse to start without a secret unless the operator opted in.
pub fn check_secret_policy(secret: &Option<Vec<u8>>, allow_insecure: bool) -> Result<()> {
    if secret.is_none() && !allow_insecure {
        bail!(
            "no webhook secret is configured; run `planbot init` to generate one, \
             or pass --insecure to serve unsigned"
        );
    }
    Ok(())
}

pub fn build_router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/approve", post(approve))
        .route("/respond", post(respond))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(state: Arc<ServeState>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("planbot webhook listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("planbot webhook shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn check_signature(state: &ServeState, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    let Some(secret) = &state.secret else {
        return Ok(());
    };
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing signature header"))?;
    if !verify(secret, body, provided) {
        return Err(AppError::unauthorized("invalid signature"));
    }
    Ok(())
}

async fn approve(
    State(state): State<Arc<ServeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    check_signature(&state, &headers, &body)?;

    let parsed: ApproveBody = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid approve body: {e}")))?;

    let resolved = state.router.resolve_approval(
        &parsed.plan_id,
        ApprovalResponse {
            approved: parsed.approved,
            reason: parsed.rejection_reason,
            responded_by: parsed.responded_by,
        },
    );
    if !resolved {
        return Err(AppError::not_found(format!(
            "no pending approval for plan {:?}",
            parsed.plan_id
        )));
    }
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

async fn respond(
    State(state): State<Arc<ServeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    check_signature(&state, &headers, &body)?;

    let parsed: RespondBody = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid respond body: {e}")))?;

    let resolved = state.router.resolve_question(
        &parsed.question_id,
        QuestionResponse {
            answer: parsed.answer,
            matched_option: false,
            responded_by: parsed.responded_by,
        },
    );
    if !resolved {
        return Err(AppError::not_found(format!(
            "no pending question {:?}",
            parsed.question_id
        )));
    }
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

async fn health(State(state): State<Arc<ServeState>>) -> axum::response::Response {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
