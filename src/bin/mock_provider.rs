//! Stand-in for the Gemini `generateContent` endpoint, for local runs and
//! load simulation. Point `models.base_url` at it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use clap::Parser;
use rand::Rng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Parser)]
struct Args {
    #[arg(long, default_value_t = 3000)]
    port: u16,
    /// Base latency per request; up to 20ms of jitter is added.
    #[arg(long, default_value_t = 500)]
    latency_ms: u64,
    /// Share of requests answered with HTTP 500.
    #[arg(long, default_value_t = 0.0)]
    error_rate: f64,
    /// Model ids answered with HTTP 404.
    #[arg(long, value_delimiter = ',')]
    missing: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.error_rate),
        "error rate must be within 0.0..=1.0"
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    tracing::info!(
        %addr,
        latency_ms = args.latency_ms,
        error_rate = args.error_rate,
        missing = ?args.missing,
        "mock model backend running"
    );

    let app = Router::new()
        .route("/v1beta/models/:action", post(handler))
        .with_state(Arc::new(args));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handler(
    State(args): State<Arc<Args>>,
    Path(action): Path<String>,
    Json(req): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(model) = action.strip_suffix(":generateContent") else {
        return error(StatusCode::NOT_FOUND, "unknown method");
    };
    if args.missing.iter().any(|m| m == model) {
        return error(StatusCode::NOT_FOUND, &format!("models/{model} is not found"));
    }

    let jitter = rand::thread_rng().gen_range(0..=20);
    sleep(Duration::from_millis(args.latency_ms + jitter)).await;

    if args.error_rate > 0.0 && rand::thread_rng().gen_bool(args.error_rate) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "simulated failure");
    }

    let prompt_len = req
        .pointer("/contents/0/parts/0/text")
        .and_then(Value::as_str)
        .map(str::len)
        .unwrap_or(0);

    (
        StatusCode::OK,
        Json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "text": format!("Mock answer from {model}.") }]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": prompt_len.div_ceil(4),
                "candidatesTokenCount": 8
            }
        })),
    )
}

fn error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "error": { "code": status.as_u16(), "message": message }
        })),
    )
}
