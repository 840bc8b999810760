use std::{convert::Infallible, future::Future, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};

use crate::gate::{
    session_gate::{GateRejection, SessionGate},
    types::{GateFragment, GateRequest},
};

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

#[derive(Clone)]
pub struct AppState {
    gate: Arc<SessionGate>,
    admin_secret: Option<Arc<str>>,
    allowed_origins: Arc<[String]>,
}

impl AppState {
    pub fn new(
        gate: Arc<SessionGate>,
        admin_secret: Option<String>,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            gate,
            admin_secret: admin_secret.map(Arc::from),
            allowed_origins: allowed_origins.into(),
        }
    }

    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        // Non-browser callers send no Origin.
        let Some(origin) = headers.get(header::ORIGIN) else {
            return true;
        };
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    fn admin_authorized(&self, presented: &str) -> bool {
        match &self.admin_secret {
            Some(secret) => bool::from(secret.as_bytes().ct_eq(presented.as_bytes())),
            None => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: &'static str,
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            status,
        }
    }

    fn forbidden_origin() -> Self {
        Self::new(StatusCode::FORBIDDEN, "origin_forbidden", "Origin Forbidden")
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", "Unauthorized")
    }
}

impl From<GateRejection> for ApiError {
    fn from(rejection: GateRejection) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            rejection.to_string(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub secret: String,
    pub enable: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .route("/admin/emergency_override", post(emergency_override))
        .route("/admin/health", get(admin_health))
        .with_state(state)
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<GateRequest>,
) -> Result<Response, ApiError> {
    if !state.origin_allowed(&headers) {
        tracing::warn!(
            target: "server",
            origin = ?headers.get(header::ORIGIN),
            "chat_origin_blocked"
        );
        return Err(ApiError::forbidden_origin());
    }

    if request.session_id.is_none() {
        request.session_id = headers
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
    }

    let turn = state.gate.handle(request).await.inspect_err(|rejection| {
        tracing::info!(target: "server", error = %rejection, "chat_rejected");
    })?;

    let body = turn
        .stream
        .map(|fragment| Ok::<_, Infallible>(Bytes::from(render_fragment(fragment))));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body))
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_build_failed",
                err.to_string(),
            )
        })?;
    if let Ok(value) = HeaderValue::from_str(&turn.session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    Ok(response)
}

/// Plain-text wire form. The gate-open signal goes on its own line so clients
/// can match it without scanning model text.
fn render_fragment(fragment: GateFragment) -> String {
    match fragment {
        GateFragment::Text(text) | GateFragment::Failure(text) => text,
        GateFragment::GateOpen(signal) => format!("\n{signal}"),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "emergency_mode": state.gate.kill_switch().is_engaged(),
    }))
}

async fn emergency_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.admin_authorized(&request.secret) {
        tracing::warn!(target: "server", "emergency_override_unauthorized");
        return Err(ApiError::unauthorized());
    }

    let previous = state.gate.kill_switch().set(request.enable);
    let mode = if request.enable {
        "ACTIVATED (Gatekeeper Disabled)"
    } else {
        "DEACTIVATED (Gatekeeper Online)"
    };
    Ok(Json(json!({
        "status": "success",
        "mode": mode,
        "previous": previous,
    })))
}

async fn admin_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let presented = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !state.admin_authorized(presented) {
        return Err(ApiError::unauthorized());
    }

    let pool = state.gate.dispatcher().pool().snapshot().await;
    let granted = state.gate.ledger().granted_count().await;
    let tracked = state.gate.ledger().tracked().await;
    Ok(Json(json!({
        "emergency_mode": state.gate.kill_switch().is_engaged(),
        "model": state.gate.dispatcher().sampling().model,
        "credentials": {
            "total": pool.total,
            "cooling": pool.cooling,
        },
        "sessions_granted": granted,
        "sessions_tracked": tracked,
    })))
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("unable to read listener address")?;
    tracing::info!(target: "server", addr = %local_addr, "server_listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")
}

/// Resolves on SIGINT or SIGTERM and reports which one arrived.
pub async fn shutdown_signal() -> Result<&'static str> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;

    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}
