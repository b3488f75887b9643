//! Model gateway: prioritized fallback over backend models with a
//! complexity-derived deadline on the single generation call.

pub mod gemini;

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::classify::Complexity;
use crate::config::TimeoutConfig;

pub use gemini::GeminiProvider;

/// Typed failures from the generation backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("credential rejected by backend")]
    Unauthorized,

    #[error("backend rate limited the request")]
    RateLimited,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("prompt blocked: {reason}")]
    Blocked { reason: String },
}

/// Failures surfaced by [`ModelGateway::generate`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("no model available (tried {})", .tried.join(", "))]
    NoModelAvailable { tried: Vec<String> },

    #[error("model {model} timed out after {after:?}")]
    Timeout { model: String, after: Duration },

    #[error("model {model} failed: {source}")]
    GenerationFailed {
        model: String,
        #[source]
        source: BackendError,
    },
}

impl ModelError {
    pub fn model(&self) -> Option<&str> {
        match self {
            ModelError::NoModelAvailable { .. } => None,
            ModelError::Timeout { model, .. } | ModelError::GenerationFailed { model, .. } => {
                Some(model)
            }
        }
    }
}

/// A usable handle on one backend model.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    fn id(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;
}

/// Hands out model handles. Failing here is what triggers fallback.
pub trait ModelProvider: Send + Sync {
    fn model(&self, id: &str) -> Result<Arc<dyn GenerativeModel>, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub model: String,
}

pub struct ModelGateway {
    provider: Arc<dyn ModelProvider>,
    candidates: Vec<String>,
    timeouts: TimeoutConfig,
    max_response_length: usize,
}

impl ModelGateway {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        candidates: Vec<String>,
        timeouts: TimeoutConfig,
        max_response_length: usize,
    ) -> Self {
        Self {
            provider,
            candidates,
            timeouts,
            max_response_length,
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn timeout_for(&self, complexity: Complexity) -> Duration {
        self.timeouts.for_complexity(complexity)
    }

    /// First candidate that yields a handle, in priority order.
    fn select(&self) -> Result<Arc<dyn GenerativeModel>, ModelError> {
        for id in &self.candidates {
            debug!(model = %id, "trying model");
            match self.provider.model(id) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(model = %id, error = %e, "model unavailable, falling back");
                }
            }
        }
        Err(ModelError::NoModelAvailable {
            tried: self.candidates.clone(),
        })
    }

    /// One generation call, abandoned (and dropped) at the deadline.
    pub async fn generate(
        &self,
        prompt: &str,
        complexity: Complexity,
    ) -> Result<Generation, ModelError> {
        let handle = self.select()?;
        let model = handle.id().to_string();
        let deadline = self.timeout_for(complexity);

        info!(model = %model, %complexity, timeout_ms = deadline.as_millis() as u64, "generating");

        let text = match tokio::time::timeout(deadline, handle.generate(prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(source)) => return Err(ModelError::GenerationFailed { model, source }),
            Err(_) => {
                return Err(ModelError::Timeout {
                    model,
                    after: deadline,
                })
            }
        };

        Ok(Generation {
            text: truncate(text, self.max_response_length),
            model,
        })
    }

    /// Ask every candidate for a short answer, concurrently; return those
    /// that replied within `timeout`.
    pub async fn probe(&self, timeout: Duration) -> Vec<String> {
        let probes = self.candidates.iter().map(|id| async move {
            let handle = self.provider.model(id).ok()?;
            match tokio::time::timeout(timeout, handle.generate("test")).await {
                Ok(Ok(_)) => Some(id.clone()),
                Ok(Err(e)) => {
                    debug!(model = %id, error = %e, "probe failed");
                    None
                }
                Err(_) => {
                    debug!(model = %id, "probe timed out");
                    None
                }
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }
}

/// Cap at `max` characters, marking the cut with an ellipsis.
pub fn truncate(text: String, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => {
            let mut text = text;
            text.truncate(cut);
            text.push_str("...");
            text
        }
        None => text,
    }
}
