//! Google Generative Language (`generateContent`) backend.

use async_trait::async_trait;
use moka::sync::Cache;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{BackendError, GenerativeModel, ModelProvider};
use crate::config::{ApiKey, ModelsConfig};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

impl GenerateContentResponse {
    fn into_text(self) -> Result<String, BackendError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(BackendError::Blocked { reason });
        }
        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(BackendError::InvalidResponse(
                "response carried no text".to_string(),
            ));
        }
        Ok(text)
    }
}

struct Shared {
    client: reqwest::Client,
    base_url: String,
    api_key: ApiKey,
    max_output_tokens: u32,
    /// Models that answered "not found", skipped until the entry expires.
    unavailable: Cache<String, ()>,
}

#[derive(Clone)]
pub struct GeminiProvider {
    shared: Arc<Shared>,
}

impl GeminiProvider {
    pub fn new(api_key: ApiKey, config: &ModelsConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let unavailable = Cache::builder()
            .max_capacity(256)
            .time_to_live(Duration::from_secs(config.unavailable_cooldown_secs.max(1)))
            .build();

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key,
                max_output_tokens: config.max_output_tokens,
                unavailable,
            }),
        })
    }
}

impl ModelProvider for GeminiProvider {
    fn model(&self, id: &str) -> Result<Arc<dyn GenerativeModel>, BackendError> {
        if id.is_empty() || id.contains(['/', '?', '#', ' ']) {
            return Err(BackendError::NotFound(id.to_string()));
        }
        if self.shared.unavailable.contains_key(id) {
            return Err(BackendError::NotFound(id.to_string()));
        }
        Ok(Arc::new(GeminiModel {
            id: id.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

pub struct GeminiModel {
    id: String,
    shared: Arc<Shared>,
}

impl GeminiModel {
    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.shared.base_url, self.id
        )
    }
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let body = GenerateContentRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.shared.max_output_tokens,
            },
        };

        let resp = self
            .shared
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.shared.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            let err = status_error(status, &self.id, message);
            if matches!(err, BackendError::NotFound(_)) {
                warn!(model = %self.id, "model not found, marking unavailable");
                self.shared.unavailable.insert(self.id.clone(), ());
            }
            return Err(err);
        }

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        parsed.into_text()
    }
}

fn status_error(status: StatusCode, model: &str, message: String) -> BackendError {
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(model.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited,
        s if s.is_server_error() => BackendError::Unavailable(format!("HTTP {}", s.as_u16())),
        s => BackendError::Api {
            status: s.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_candidate_parts() {
        let resp: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello "},{"text":"world"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.into_text().unwrap(), "Hello world");
    }

    #[test]
    fn blocked_prompt_is_typed() {
        let resp: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(
            resp.into_text().unwrap_err(),
            BackendError::Blocked {
                reason: "SAFETY".into()
            }
        );
    }

    #[test]
    fn empty_candidates_are_invalid() {
        let resp: GenerateContentResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(matches!(
            resp.into_text(),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn statuses_map_to_variants() {
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, "m", String::new()),
            BackendError::NotFound("m".into())
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, "m", String::new()),
            BackendError::Unauthorized
        );
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "m", String::new()),
            BackendError::RateLimited
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "m", String::new()),
            BackendError::Unavailable(_)
        ));
        assert_eq!(
            status_error(StatusCode::BAD_REQUEST, "m", "bad".into()),
            BackendError::Api {
                status: 400,
                message: "bad".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_model_ids() {
        let provider = GeminiProvider::new(
            ApiKey::parse(Some("AIzaTest")).unwrap(),
            &ModelsConfig::default(),
        )
        .unwrap();
        assert!(provider.model("gemini-1.5-flash").is_ok());
        assert!(provider.model("").is_err());
        assert!(provider.model("../admin").is_err());
    }
}
