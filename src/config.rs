//! Process configuration
//!
//! Built once at startup from the environment and passed into
//! constructors; no ambient global state.

use std::time::Duration;

/// Chat-completion service settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl LlmConfig {
    /// Read settings from the environment (after `dotenv`), falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or(defaults.api_key),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
            temperature: env_parse("LLM_TEMPERATURE", defaults.temperature),
            max_tokens: env_parse("LLM_MAX_TOKENS", defaults.max_tokens),
            max_retries: env_parse("LLM_MAX_RETRIES", defaults.max_retries),
            retry_base_delay: Duration::from_millis(env_parse(
                "LLM_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )),
            request_timeout: Duration::from_secs(env_parse(
                "LLM_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
        }
    }
}

/// Top-level application settings for the API binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    /// Root of the versioned prompt template tree.
    pub prompt_dir: String,
    pub prompt_version: String,
    pub port: u16,
    /// Postgres connection string; absent means the in-memory store.
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            llm: LlmConfig::from_env(),
            prompt_dir: std::env::var("PROMPT_DIR").unwrap_or_else(|_| "prompts".to_string()),
            prompt_version: std::env::var("PROMPT_VERSION").unwrap_or_else(|_| "v1.0".to_string()),
            port: env_parse("PORT", 8080),
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("POSTGRES_URL"))
                .ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LlmConfig::default();
        assert_eq!(cfg.model, "gpt-4o");
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_env_parse_fallback() {
        // Key almost certainly unset; falls back cleanly.
        let value: u32 = env_parse("RAO_DOES_NOT_EXIST", 42);
        assert_eq!(value, 42);
    }
}
