//! Request orchestration: validate, classify, rate-check, consult the cache,
//! generate on a miss, then reply. Every stage may short-circuit; nothing is
//! retried here.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{GeminiProvider, ModelGateway, ModelProvider};
use crate::cache::ResponseCache;
use crate::classify::{Category, Classifier, Complexity};
use crate::config::{ApiKey, Config, ConfigError, CredentialError};
use crate::error::{ChatError, ChatFailure};
use crate::model::{
    timestamp, ChatReply, HealthReport, HealthStatus, ModelHealth, ModelStatus, RateLimitHealth,
    ReplyMetadata, ServicesHealth, TierLimits,
};
use crate::prompt;
use crate::ratelimit::{identity_key, DenyReason, RateLimiter, RateTier};
use crate::stats::ChatStats;
use crate::validate::Validator;

/// Where a request failed, for logging.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Parse,
    Validate,
    RateLimit,
    Configure,
    Generate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Parse => "parse",
            Stage::Validate => "validate",
            Stage::RateLimit => "rate_limit",
            Stage::Configure => "configure",
            Stage::Generate => "generate",
        })
    }
}

struct StageError {
    stage: Stage,
    error: ChatError,
}

impl StageError {
    fn at(stage: Stage) -> impl FnOnce(ChatError) -> StageError {
        move |error| StageError { stage, error }
    }
}

/// Per-request state. Never shared across requests.
#[derive(Debug)]
struct RequestContext<'a> {
    request_id: &'a str,
    identity: String,
    raw_message: String,
    message: String,
    user_id: Option<String>,
    category: Category,
    complexity: Complexity,
    started: Instant,
}

/// Whether a generation backend can be used at all.
pub enum Backend {
    Ready(ModelGateway),
    Unconfigured(CredentialError),
}

impl Backend {
    /// Gemini backend from `GOOGLE_API_KEY`, or unconfigured when the
    /// credential is missing or malformed.
    pub fn from_env(config: &Config) -> Result<Self, ConfigError> {
        match ApiKey::from_env() {
            Ok(key) => {
                let provider = GeminiProvider::new(key, &config.models)?;
                Ok(Self::with_provider(config, Arc::new(provider)))
            }
            Err(e) => Ok(Backend::Unconfigured(e)),
        }
    }

    pub fn with_provider(config: &Config, provider: Arc<dyn ModelProvider>) -> Self {
        Backend::Ready(ModelGateway::new(
            provider,
            config.models.candidates.clone(),
            config.timeouts,
            config.limits.max_response_length,
        ))
    }
}

pub struct ChatService {
    validator: Validator,
    classifier: Classifier,
    limiter: RateLimiter,
    cache: ResponseCache,
    backend: Backend,
    stats: ChatStats,
    system_prompt: String,
    probe_timeout: std::time::Duration,
}

impl ChatService {
    pub fn new(config: &Config, backend: Backend) -> Result<Self, ConfigError> {
        Ok(Self {
            validator: Validator::new(&config.limits)?,
            classifier: Classifier::new()?,
            limiter: RateLimiter::new(config.rate_limit.clone()),
            cache: ResponseCache::new(&config.cache),
            backend,
            stats: ChatStats::new()?,
            system_prompt: config.prompt.system.clone(),
            probe_timeout: config.models.probe_timeout(),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn stats(&self) -> &ChatStats {
        &self.stats
    }

    /// Handle one `POST /chat` body from the client at `address`.
    pub async fn handle(&self, address: &str, body: &[u8]) -> Result<ChatReply, ChatFailure> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        info!(request_id = %request_id, address, "request received");

        match self.process(&request_id, address, body, started).await {
            Ok(reply) => Ok(reply),
            Err(StageError { stage, error }) => {
                self.stats.record_failure(error.code());
                if error.status().is_server_error() {
                    error!(request_id = %request_id, %stage, error = %error, "request failed");
                } else {
                    warn!(request_id = %request_id, %stage, error = %error, "request rejected");
                }
                Err(ChatFailure { request_id, error })
            }
        }
    }

    async fn process(
        &self,
        request_id: &str,
        address: &str,
        body: &[u8],
        started: Instant,
    ) -> Result<ChatReply, StageError> {
        let input: Value = serde_json::from_slice(body)
            .map_err(|e| ChatError::InvalidJson(e.to_string()))
            .map_err(StageError::at(Stage::Parse))?;

        let ctx = self
            .admit(request_id, address, &input, started)
            .map_err(StageError::at(Stage::Validate))?;

        debug!(
            request_id,
            category = %ctx.category,
            complexity = %ctx.complexity,
            message_length = ctx.message.chars().count(),
            raw_length = ctx.raw_message.chars().count(),
            "query analysis"
        );

        let tier = RateTier::for_query(ctx.category, ctx.complexity);
        let decision = self.limiter.check(&ctx.identity, tier);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or(DenyReason::MinuteLimit);
            return Err(StageError::at(Stage::RateLimit)(ChatError::RateLimited {
                reason,
                retry_after: decision.retry_after_secs.unwrap_or(3600),
            }));
        }

        let user_id = ctx.user_id.as_deref();
        if let Some(entry) = self.cache.get(&ctx.message, user_id).await {
            info!(request_id, category = %ctx.category, "cache hit");
            return Ok(self.reply(&ctx, entry.payload, true, None));
        }

        let gateway = match &self.backend {
            Backend::Ready(gateway) => gateway,
            Backend::Unconfigured(e) => {
                return Err(StageError::at(Stage::Configure)(ChatError::Unconfigured(
                    e.clone(),
                )))
            }
        };

        let full_prompt = prompt::build(&self.system_prompt, ctx.category, &ctx.message);
        let lookup = self
            .cache
            .get_or_generate(&ctx.message, user_id, ctx.category, async {
                gateway
                    .generate(&full_prompt, ctx.complexity)
                    .await
                    .map(|g| (g.text, g.model))
            })
            .await
            .map_err(|e| ChatError::Model((*e).clone()))
            .map_err(StageError::at(Stage::Generate))?;

        let entry = lookup.entry;
        let metadata = lookup.fresh.then(|| ReplyMetadata {
            model: entry.model.clone(),
            query_type: ctx.category,
            complexity: ctx.complexity,
        });

        info!(
            request_id,
            model = %entry.model,
            category = %ctx.category,
            shared = !lookup.fresh,
            duration_ms = ctx.started.elapsed().as_millis() as u64,
            response_length = entry.payload.chars().count(),
            estimated_tokens = (ctx.message.len() + entry.payload.len()).div_ceil(4),
            "request completed"
        );

        Ok(self.reply(&ctx, entry.payload, !lookup.fresh, metadata))
    }

    /// Validate, sanitize and classify the body into a request context.
    fn admit<'a>(
        &self,
        request_id: &'a str,
        address: &str,
        input: &Value,
        started: Instant,
    ) -> Result<RequestContext<'a>, ChatError> {
        let validation = self.validator.validate(input);
        if !validation.valid {
            return Err(ChatError::Validation(validation.errors));
        }

        let raw_message = input
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Internal("validated message missing".to_string()))?
            .to_string();
        let user_id = input
            .get("userId")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        let message = self.validator.sanitize(&raw_message);
        Ok(RequestContext {
            request_id,
            identity: identity_key(address, user_id.as_deref()),
            category: self.classifier.classify(&message),
            complexity: self.classifier.complexity(&message),
            raw_message,
            message,
            user_id,
            started,
        })
    }

    fn reply(
        &self,
        ctx: &RequestContext<'_>,
        response: String,
        cached: bool,
        metadata: Option<ReplyMetadata>,
    ) -> ChatReply {
        let elapsed = ctx.started.elapsed();
        self.stats.record_success(ctx.category, cached, elapsed);
        ChatReply {
            response,
            cached,
            request_id: ctx.request_id.to_string(),
            timestamp: timestamp(),
            processing_time: elapsed.as_millis() as u64,
            metadata,
        }
    }

    /// Probe the models and summarise every subsystem.
    pub async fn health(&self) -> HealthReport {
        self.limiter.sweep();

        let model = match &self.backend {
            Backend::Ready(gateway) => {
                let available_models = gateway.probe(self.probe_timeout).await;
                ModelHealth {
                    status: if available_models.is_empty() {
                        ModelStatus::Degraded
                    } else {
                        ModelStatus::Healthy
                    },
                    available_models,
                    configured: true,
                }
            }
            Backend::Unconfigured(_) => ModelHealth {
                status: ModelStatus::Unconfigured,
                available_models: Vec::new(),
                configured: false,
            },
        };

        let status = match model.status {
            ModelStatus::Healthy => HealthStatus::Healthy,
            ModelStatus::Degraded => HealthStatus::Degraded,
            ModelStatus::Unconfigured => HealthStatus::Unhealthy,
        };

        let limiter = self.limiter.stats();
        HealthReport {
            status,
            timestamp: timestamp(),
            version: env!("CARGO_PKG_VERSION"),
            services: ServicesHealth {
                model,
                cache: self.cache.stats(),
                rate_limit: RateLimitHealth {
                    status: HealthStatus::Healthy,
                    limits: TierLimits {
                        default: self.limiter.limits(RateTier::Default),
                        simple_query: self.limiter.limits(RateTier::SimpleQuery),
                        file_analysis: self.limiter.limits(RateTier::FileAnalysis),
                        complex_analysis: self.limiter.limits(RateTier::ComplexAnalysis),
                    },
                    tracked_identities: limiter.tracked_identities,
                    blacklisted: limiter.blacklisted,
                },
            },
            metrics: self.stats.snapshot(),
        }
    }
}
