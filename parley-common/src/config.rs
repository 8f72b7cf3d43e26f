//! Environment-driven configuration for Parley services.
//!
//! All settings come from environment variables with sensible defaults;
//! only the upstream API credential is mandatory. Variables use the
//! `PARLEY_` prefix (the API key also falls back to `OPENAI_API_KEY`).

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Top-level configuration, grouped by concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
    pub image: ImageConfig,
    pub language: LanguageConfig,
    pub observability: ObservabilityConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host (default: 127.0.0.1)
    pub host: String,
    /// Bind port (default: 8300)
    pub port: u16,
    /// Maximum request body size in bytes (default: 8 MiB)
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8300,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Upstream chat completions API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// API credential (required)
    pub api_key: String,
    /// Base URL of the OpenAI-compatible API
    pub base_url: String,
    /// Model used for streaming text completions
    pub model: String,
    /// Model used for single-shot multimodal completions
    pub vision_model: String,
    /// Token budget for streaming completions
    pub max_tokens: u32,
    /// Token budget for multimodal completions (higher, non-incremental)
    pub vision_max_tokens: u32,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Retry count for failed single-shot calls
    pub max_retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            vision_model: "gpt-4o".to_string(),
            max_tokens: 1024,
            vision_max_tokens: 4096,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

/// Session lifecycle and history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity TTL in seconds before a session is evicted (default: 6h)
    pub ttl_secs: u64,
    /// Reaper wake interval in seconds (default: 1h)
    pub sweep_interval_secs: u64,
    /// History policy knob: "full", "recent:<N>", or "cap:<N>"
    pub history: String,
    /// System instruction installed as the first turn of every session
    pub system_prompt: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 6 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            history: "cap:100".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Default system instruction. The `{lang}` placeholder is replaced with
/// the detected language tag before the request is sent upstream.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that responds in the same \
     language as the user's input. The detected language is {lang}. Ensure that punctuation \
     marks are placed at the end of the sentence, not at the beginning.";

/// Image upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Maximum accepted image size in bytes (default: 4 MiB)
    pub max_bytes: usize,
    /// Remove an image from the cache as soon as it is used in a turn
    pub consume_on_use: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_bytes: 4 * 1024 * 1024,
            consume_on_use: false,
        }
    }
}

/// Language detection policy.
///
/// Detection is informational: it feeds the system prompt and never fails
/// a request. When `enforced` is non-empty, a detected tag outside the
/// list is replaced with `fallback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Accepted language tags; empty means unrestricted
    pub enforced: Vec<String>,
    /// Tag used when detection fails or the detected tag is not accepted
    pub fallback: String,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            enforced: Vec::new(),
            fallback: "en".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Output format: "pretty" or "json"
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Fails only when the upstream API key is missing.
    pub fn load() -> Result<Self> {
        let api_key = std::env::var("PARLEY_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                Error::Config("PARLEY_API_KEY or OPENAI_API_KEY must be set".to_string())
            })?;

        let defaults = UpstreamConfig::default();
        let upstream = UpstreamConfig {
            api_key,
            base_url: env_or("PARLEY_UPSTREAM_URL", defaults.base_url),
            model: env_or("PARLEY_MODEL", defaults.model),
            vision_model: env_or("PARLEY_VISION_MODEL", defaults.vision_model),
            max_tokens: env_parse("PARLEY_MAX_TOKENS", defaults.max_tokens)?,
            vision_max_tokens: env_parse("PARLEY_VISION_MAX_TOKENS", defaults.vision_max_tokens)?,
            timeout_secs: env_parse("PARLEY_UPSTREAM_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: env_parse("PARLEY_UPSTREAM_RETRIES", defaults.max_retries)?,
        };

        let defaults = ServerConfig::default();
        let server = ServerConfig {
            host: env_or("PARLEY_HOST", defaults.host),
            port: env_parse("PARLEY_PORT", defaults.port)?,
            max_body_bytes: env_parse("PARLEY_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            ttl_secs: env_parse("PARLEY_SESSION_TTL_SECS", defaults.ttl_secs)?,
            sweep_interval_secs: env_parse(
                "PARLEY_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            history: env_or("PARLEY_HISTORY", defaults.history),
            system_prompt: env_or("PARLEY_SYSTEM_PROMPT", defaults.system_prompt),
        };

        let defaults = ImageConfig::default();
        let image = ImageConfig {
            max_bytes: env_parse("PARLEY_MAX_IMAGE_BYTES", defaults.max_bytes)?,
            consume_on_use: env_parse("PARLEY_CONSUME_IMAGES", defaults.consume_on_use)?,
        };

        let defaults = LanguageConfig::default();
        let language = LanguageConfig {
            enforced: env_list("PARLEY_LANGUAGES"),
            fallback: env_or("PARLEY_LANGUAGE_FALLBACK", defaults.fallback),
        };

        let defaults = ObservabilityConfig::default();
        let observability = ObservabilityConfig {
            log_level: env_or("PARLEY_LOG_LEVEL", defaults.log_level),
            log_format: env_or("PARLEY_LOG_FORMAT", defaults.log_format),
        };

        Ok(Self {
            server,
            upstream,
            session,
            image,
            language,
            observability,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            session: SessionConfig::default(),
            image: ImageConfig::default(),
            language: LanguageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
