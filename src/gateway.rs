use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer,
    set_header::SetResponseHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{ApiKey, CredentialError};
use crate::error::{ChatError, ChatFailure};
use crate::model::{ConfigCheck, HealthStatus};
use crate::orchestrator::ChatService;

pub struct AppState {
    pub service: Arc<ChatService>,
    pub trust_forwarded: bool,
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "permissions-policy",
        "geolocation=(), microphone=(), camera=()",
    ),
];

pub fn router(state: Arc<AppState>, body_limit: usize) -> Router {
    let mut app = Router::new()
        .route("/chat", post(handle_chat))
        .route("/api/chat", post(handle_chat).get(handle_health))
        .route("/health", get(handle_health))
        .route("/config/check", get(handle_config_check))
        .route("/api/test", get(handle_config_check))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http());

    for &(name, value) in SECURITY_HEADERS {
        app = app.layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }
    app
}

/// Client address: first forwarded hop, then `X-Real-IP`, then the peer.
/// The headers are ignored unless `trust_forwarded` is set.
pub fn client_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> String {
    let peer = || peer.map(|addr| addr.ip().to_string());
    if !trust_forwarded {
        return peer().unwrap_or_else(|| "unknown".to_string());
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(peer)
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn handle_chat(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let address = client_address(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.trust_forwarded,
    );
    match state.service.handle(&address, &body).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(failure) => failure.into_response(),
    }
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let report = state.service.health().await;
    info!(status = ?report.status, "health check performed");

    let status = if report.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Report whether the model credential is present and well-formed.
pub async fn handle_config_check() -> Json<ConfigCheck> {
    let check = match ApiKey::from_env() {
        Ok(key) => ConfigCheck {
            status: "success",
            message: Some("Configuration OK".to_string()),
            error: None,
            api_key_length: Some(key.len()),
            api_key_prefix: Some(key.masked()),
        },
        Err(e) => ConfigCheck {
            status: "error",
            message: match e {
                CredentialError::Missing => Some("Set GOOGLE_API_KEY in the environment".into()),
                CredentialError::Malformed => Some("The API key must start with \"AIza\"".into()),
            },
            error: Some(e.to_string()),
            api_key_length: None,
            api_key_prefix: None,
        },
    };
    Json(check)
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    let request_id = Uuid::new_v4().to_string();
    error!(request_id = %request_id, detail, "handler panicked");

    ChatFailure {
        request_id,
        error: ChatError::Internal(detail.to_string()),
    }
    .into_response()
}
