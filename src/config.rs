//! Service configuration.
//!
//! Everything is optional: a missing file or section falls back to the
//! defaults below. The model credential is only ever read from the
//! environment (`GOOGLE_API_KEY`), never from the TOML file.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::classify::{Category, Complexity};
use crate::ratelimit::{Limits, RateTier};

pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";
pub const ADDRESS_ENV: &str = "CHAT_EDGE_ADDRESS";
const API_KEY_PREFIX: &str = "AIza";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid content pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid address {0:?}")]
    Address(String),

    #[error("failed to set up metrics: {0}")]
    Metrics(#[from] hdrhistogram::CreationError),

    #[error("failed to set up model backend: {0}")]
    Backend(#[from] crate::backend::BackendError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub models: ModelsConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub prompt: PromptConfig,
}

impl Config {
    /// Load from an explicit TOML file, or defaults when no path is given,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Config::default(),
        };

        if let Ok(address) = std::env::var(ADDRESS_ENV) {
            config.server.address = address;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub body_limit_bytes: usize,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only safe behind a proxy that overwrites those headers; otherwise
    /// clients can rotate them to dodge the rate limits.
    pub trust_forwarded: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            body_limit_bytes: 64 * 1024,
            trust_forwarded: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Backend model identifiers in fallback order.
    pub candidates: Vec<String>,
    pub base_url: String,
    pub max_output_tokens: u32,
    pub probe_timeout_secs: u64,
    /// How long a model that answered "not found" is skipped.
    pub unavailable_cooldown_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                "gemini-1.5-flash-latest".to_string(),
                "gemini-1.5-flash".to_string(),
                "gemini-1.5-pro-latest".to_string(),
                "gemini-1.5-pro".to_string(),
            ],
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            max_output_tokens: 4096,
            probe_timeout_secs: 5,
            unavailable_cooldown_secs: 600,
        }
    }
}

impl ModelsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fast_secs: u64,
    pub normal_secs: u64,
    pub complex_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fast_secs: 15,
            normal_secs: 30,
            complex_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn for_complexity(&self, complexity: Complexity) -> Duration {
        let secs = match complexity {
            Complexity::Fast => self.fast_secs,
            Complexity::Normal => self.normal_secs,
            Complexity::Complex => self.complex_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_message_length: usize,
    pub max_response_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: 5000,
            max_response_length: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub ttl: CacheTtls,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: CacheTtls::default(),
        }
    }
}

/// Per-category cache lifetimes, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub invoice_analysis: u64,
    pub margin_optimization: u64,
    pub excel_formulas: u64,
    pub fifa_projections: u64,
    pub general_consultation: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            invoice_analysis: 600,
            margin_optimization: 1800,
            excel_formulas: 3600,
            fifa_projections: 86_400,
            general_consultation: 600,
        }
    }
}

impl CacheTtls {
    pub fn for_category(&self, category: Category) -> Duration {
        let secs = match category {
            Category::InvoiceAnalysis => self.invoice_analysis,
            Category::MarginOptimization => self.margin_optimization,
            Category::ExcelFormulas => self.excel_formulas,
            Category::FifaProjections => self.fifa_projections,
            Category::GeneralConsultation => self.general_consultation,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default: Limits,
    pub simple_query: Limits,
    pub file_analysis: Limits,
    pub complex_analysis: Limits,
    /// Identity keys rejected unconditionally.
    pub blacklist: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: Limits::new(60, 1000),
            simple_query: Limits::new(30, 500),
            file_analysis: Limits::new(10, 100),
            complex_analysis: Limits::new(5, 50),
            blacklist: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self, tier: RateTier) -> Limits {
        match tier {
            RateTier::SimpleQuery => self.simple_query,
            RateTier::FileAnalysis => self.file_analysis,
            RateTier::ComplexAnalysis => self.complex_analysis,
            RateTier::Default => self.default,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: crate::prompt::DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("GOOGLE_API_KEY is not set")]
    Missing,

    #[error("GOOGLE_API_KEY must start with \"AIza\"")]
    Malformed,
}

/// A generation-backend credential that passed the prefix check.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn parse(raw: Option<&str>) -> Result<Self, CredentialError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        match raw {
            None => Err(CredentialError::Missing),
            Some(key) if !key.starts_with(API_KEY_PREFIX) => Err(CredentialError::Malformed),
            Some(key) => Ok(Self(key.to_string())),
        }
    }

    pub fn from_env() -> Result<Self, CredentialError> {
        Self::parse(std::env::var(API_KEY_ENV).ok().as_deref())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The first characters of the key followed by an ellipsis.
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(API_KEY_PREFIX.len()).collect();
        format!("{prefix}...")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&self.masked()).finish()
    }
}
