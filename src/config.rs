use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::models::ComparisonPeriod;

/// Application-level constants
pub const APP_NAME: &str = "MedTrend";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Documented placeholder credential meaning "no key configured".
pub const PLACEHOLDER_API_KEY: &str = "sk-proj-1234567890";

/// Smallest accepted context budget, in characters.
pub const MIN_CONTEXT_CHAR_BUDGET: usize = 1000;

pub const DEFAULT_REASONING_ENDPOINT: &str = "http://localhost:11434/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "llama3.1";

/// Default tracing filter when RUST_LOG is not set.
pub fn default_log_filter() -> &'static str {
    "medtrend=info"
}

/// Get the application data directory (~/MedTrend/).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn default_database_path() -> PathBuf {
    app_data_dir().join("medtrend.db")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Reasoning-engine credential, resolved once at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialState {
    Configured(String),
    /// The documented placeholder value was supplied.
    PlaceholderUnset,
    Absent,
}

impl CredentialState {
    pub fn resolve(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Absent,
            Some(PLACEHOLDER_API_KEY) => Self::PlaceholderUnset,
            Some(key) => Self::Configured(key.to_string()),
        }
    }

    /// Bearer token to attach, if any.
    pub fn bearer(&self) -> Option<&str> {
        match self {
            Self::Configured(key) => Some(key),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Configured(_) => "configured",
            Self::PlaceholderUnset => "placeholder_unset",
            Self::Absent => "absent",
        }
    }
}

// Never print the secret.
impl std::fmt::Debug for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub reasoning_endpoint: String,
    pub model_identifier: String,
    pub credential: CredentialState,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub total_budget: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    pub context_char_budget: usize,
    pub default_comparison_period: ComparisonPeriod,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            reasoning_endpoint: DEFAULT_REASONING_ENDPOINT.into(),
            model_identifier: DEFAULT_MODEL.into(),
            credential: CredentialState::Absent,
            request_timeout: Duration::from_secs(120),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            total_budget: Duration::from_secs(300),
            temperature: 0.7,
            max_tokens: 2000,
            context_char_budget: 12_000,
            default_comparison_period: ComparisonPeriod::SixMonths,
            cache_enabled: true,
            cache_size: 200,
            cache_ttl: Duration::from_secs(12 * 3600),
        }
    }
}

impl AppConfig {
    /// Resolve from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            database_path: get("MEDTREND_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            reasoning_endpoint: get("OPENAI_BASE_URL")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.reasoning_endpoint),
            model_identifier: get("OPENAI_MODEL")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.model_identifier),
            credential: CredentialState::resolve(lookup("OPENAI_API_KEY").as_deref()),
            request_timeout: parsed::<u64>(&get, "LLM_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_retries: parsed(&get, "LLM_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_base_delay: parsed::<u64>(&get, "LLM_RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            total_budget: parsed::<u64>(&get, "LLM_TOTAL_BUDGET")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.total_budget),
            temperature: parsed(&get, "LLM_TEMPERATURE")?.unwrap_or(defaults.temperature),
            max_tokens: parsed(&get, "LLM_MAX_TOKENS")?.unwrap_or(defaults.max_tokens),
            context_char_budget: parsed(&get, "CONTEXT_CHAR_BUDGET")?
                .unwrap_or(defaults.context_char_budget),
            default_comparison_period: match get("DEFAULT_COMPARISON_PERIOD") {
                Some(v) => ComparisonPeriod::from_str(v.trim()).map_err(|_| {
                    ConfigError::InvalidValue {
                        var: "DEFAULT_COMPARISON_PERIOD",
                        value: v.clone(),
                        reason: "expected 1month, 3months, 6months, 1year or all".into(),
                    }
                })?,
                None => defaults.default_comparison_period,
            },
            cache_enabled: match get("LLM_CACHE_ENABLED") {
                Some(v) => parse_bool("LLM_CACHE_ENABLED", &v)?,
                None => defaults.cache_enabled,
            },
            cache_size: parsed(&get, "LLM_CACHE_SIZE")?.unwrap_or(defaults.cache_size),
            cache_ttl: parsed::<u64>(&get, "LLM_CACHE_TTL_HOURS")?
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.cache_ttl),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reasoning_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("reasoning endpoint is empty".into()));
        }
        if self.model_identifier.trim().is_empty() {
            return Err(ConfigError::Invalid("model identifier is empty".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request timeout must be positive".into()));
        }
        if self.total_budget.is_zero() {
            return Err(ConfigError::Invalid("total reasoning budget must be positive".into()));
        }
        if self.context_char_budget < MIN_CONTEXT_CHAR_BUDGET {
            return Err(ConfigError::Invalid(format!(
                "context budget {} is below the minimum of {MIN_CONTEXT_CHAR_BUDGET} characters",
                self.context_char_budget
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} outside 0.0-2.0",
                self.temperature
            )));
        }
        Ok(())
    }

    /// Redacted view for health checks and startup logs.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            app_version: APP_VERSION,
            database_path: self.database_path.display().to_string(),
            reasoning_endpoint: self.reasoning_endpoint.clone(),
            model_identifier: self.model_identifier.clone(),
            credential: self.credential.label(),
            request_timeout_secs: self.request_timeout.as_secs(),
            max_retries: self.max_retries,
            context_char_budget: self.context_char_budget,
            default_comparison_period: self.default_comparison_period,
            cache_enabled: self.cache_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub app_version: &'static str,
    pub database_path: String,
    pub reasoning_endpoint: String,
    pub model_identifier: String,
    pub credential: &'static str,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub context_char_budget: usize,
    pub default_comparison_period: ComparisonPeriod,
    pub cache_enabled: bool,
}

fn parsed<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}
