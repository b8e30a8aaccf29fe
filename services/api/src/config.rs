use s2s_core::config::{DEFAULT_TOOL_TIMEOUT, InferenceConfig};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// WebSocket endpoint of the remote speech-to-speech model service.
    pub upstream_url: String,
    pub log_level: Level,
    pub voice_id: Option<String>,
    pub inference: InferenceConfig,
    pub tool_timeout: Duration,
    pub system_prompt_path: Option<PathBuf>,
    pub knowledge_base_path: Option<PathBuf>,
    pub conversation_log: Option<PathBuf>,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn optional_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8081".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let upstream_url = std::env::var("UPSTREAM_URL")
            .map_err(|_| ConfigError::MissingVar("UPSTREAM_URL".to_string()))?;
        if !(upstream_url.starts_with("ws://") || upstream_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "UPSTREAM_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", upstream_url),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let voice_id = std::env::var("VOICE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let defaults = InferenceConfig::default();
        let inference = InferenceConfig {
            max_tokens: parse_var("MAX_TOKENS", defaults.max_tokens)?,
            top_p: parse_var("TOP_P", defaults.top_p)?,
            temperature: parse_var("TEMPERATURE", defaults.temperature)?,
        };
        inference
            .validate()
            .map_err(|e| ConfigError::InvalidValue("MAX_TOKENS/TOP_P/TEMPERATURE".to_string(), e.to_string()))?;

        let tool_timeout_ms = parse_var("TOOL_TIMEOUT_MS", DEFAULT_TOOL_TIMEOUT.as_millis() as u64)?;
        if tool_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "TOOL_TIMEOUT_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            upstream_url,
            log_level,
            voice_id,
            inference,
            tool_timeout: Duration::from_millis(tool_timeout_ms),
            system_prompt_path: optional_path("SYSTEM_PROMPT_PATH"),
            knowledge_base_path: optional_path("KNOWLEDGE_BASE_PATH"),
            conversation_log: optional_path("CONVERSATION_LOG"),
        })
    }
}
