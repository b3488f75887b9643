//! Client-facing error taxonomy and its HTTP mapping.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::backend::{BackendError, ModelError};
use crate::config::CredentialError;
use crate::model::{timestamp, ErrorReply};
use crate::ratelimit::DenyReason;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid JSON in request body: {0}")]
    InvalidJson(String),

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("rate limited ({}), retry after {retry_after}s", .reason.as_str())]
    RateLimited { reason: DenyReason, retry_after: u64 },

    #[error("model backend is not configured: {0}")]
    Unconfigured(#[from] CredentialError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::InvalidJson(_) | ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Unconfigured(_) | ChatError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ChatError::Model(e) => match e {
                ModelError::NoModelAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                ModelError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
                ModelError::GenerationFailed { source, .. } => match source {
                    BackendError::NotFound(_)
                    | BackendError::RateLimited
                    | BackendError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    BackendError::Blocked { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                },
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidJson(_) => "INVALID_JSON",
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ChatError::Unconfigured(_) => "CONFIGURATION_ERROR",
            ChatError::Internal(_) => "INTERNAL_ERROR",
            ChatError::Model(ModelError::GenerationFailed {
                source: BackendError::Unauthorized,
                ..
            }) => "CONFIGURATION_ERROR",
            ChatError::Model(_) => match self.status() {
                StatusCode::REQUEST_TIMEOUT => "TIMEOUT",
                StatusCode::SERVICE_UNAVAILABLE => "MODEL_UNAVAILABLE",
                StatusCode::BAD_REQUEST => "VALIDATION_ERROR",
                _ => "INTERNAL_ERROR",
            },
        }
    }

    /// Text safe to show a client. Never carries backend internals.
    fn public_message(&self) -> &'static str {
        match self.code() {
            "INVALID_JSON" => "Invalid JSON in request body",
            "VALIDATION_ERROR" => "Validation failed",
            "RATE_LIMIT_EXCEEDED" => "Rate limit exceeded",
            "CONFIGURATION_ERROR" => "API configuration error",
            "TIMEOUT" => "Request timeout",
            "MODEL_UNAVAILABLE" => "AI model temporarily unavailable",
            _ => "Internal server error",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ChatError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// A failed request: the error plus the request it belongs to.
#[derive(Debug)]
pub struct ChatFailure {
    pub request_id: String,
    pub error: ChatError,
}

impl IntoResponse for ChatFailure {
    fn into_response(self) -> Response {
        let details = match &self.error {
            ChatError::Validation(errors) => Some(errors.clone()),
            _ => None,
        };
        let retry_after = self.error.retry_after();

        let body = ErrorReply {
            error: self.error.public_message().to_string(),
            code: self.error.code(),
            request_id: self.request_id,
            timestamp: timestamp(),
            details,
            retry_after,
        };

        let mut response = (self.error.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;

    #[test]
    fn taxonomy_maps_to_status_and_code() {
        let cases = [
            (ChatError::InvalidJson("eof".into()), 400, "INVALID_JSON"),
            (ChatError::Validation(vec!["x".into()]), 400, "VALIDATION_ERROR"),
            (
                ChatError::RateLimited {
                    reason: DenyReason::MinuteLimit,
                    retry_after: 60,
                },
                429,
                "RATE_LIMIT_EXCEEDED",
            ),
            (
                ChatError::Unconfigured(CredentialError::Missing),
                500,
                "CONFIGURATION_ERROR",
            ),
            (
                ModelError::NoModelAvailable { tried: vec![] }.into(),
                503,
                "MODEL_UNAVAILABLE",
            ),
            (
                ModelError::Timeout {
                    model: "m".into(),
                    after: Duration::from_secs(15),
                }
                .into(),
                408,
                "TIMEOUT",
            ),
            (
                ModelError::GenerationFailed {
                    model: "m".into(),
                    source: BackendError::NotFound("m".into()),
                }
                .into(),
                503,
                "MODEL_UNAVAILABLE",
            ),
            (
                ModelError::GenerationFailed {
                    model: "m".into(),
                    source: BackendError::Transport("reset".into()),
                }
                .into(),
                500,
                "INTERNAL_ERROR",
            ),
            (
                ModelError::GenerationFailed {
                    model: "m".into(),
                    source: BackendError::Unauthorized,
                }
                .into(),
                500,
                "CONFIGURATION_ERROR",
            ),
            (ChatError::Internal("boom".into()), 500, "INTERNAL_ERROR"),
        ];

        for (error, status, code) in cases {
            assert_eq!(error.status().as_u16(), status, "{error}");
            assert_eq!(error.code(), code, "{error}");
        }
    }

    #[tokio::test]
    async fn rate_limited_response_carries_retry_after() {
        let failure = ChatFailure {
            request_id: "req-1".into(),
            error: ChatError::RateLimited {
                reason: DenyReason::MinuteLimit,
                retry_after: 60,
            },
        };
        let response = failure.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["retryAfter"], 60);
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn internal_details_are_hidden() {
        let failure = ChatFailure {
            request_id: "req-2".into(),
            error: ChatError::Internal("db password is hunter2".into()),
        };
        let bytes = failure
            .into_response()
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("Internal server error"));
    }
}
