//! Classification client configuration.

use std::time::Duration;

use tally_core::defaults;

/// Configuration for the OpenAI-compatible classification backend.
#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    /// Base URL of the service (e.g. `https://api.openai.com/v1`).
    pub base_url: String,
    /// Bearer credential. `None` means classification degrades to the
    /// fallback category instead of calling out.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::CLASSIFY_BASE_URL.to_string(),
            api_key: None,
            model: defaults::CLASSIFY_MODEL.to_string(),
            timeout: Duration::from_secs(defaults::CLASSIFY_TIMEOUT_SECS),
        }
    }
}

impl ClassifyConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TALLY_CLASSIFY_BASE_URL` | OpenAI API | Service base URL |
    /// | `TALLY_CLASSIFY_API_KEY` | unset | Bearer credential |
    /// | `TALLY_CLASSIFY_MODEL` | `gpt-4o-mini` | Model identifier |
    /// | `TALLY_CLASSIFY_TIMEOUT_SECS` | `30` | Request timeout |
    pub fn from_env() -> Self {
        let base_url = std::env::var("TALLY_CLASSIFY_BASE_URL")
            .unwrap_or_else(|_| defaults::CLASSIFY_BASE_URL.to_string());
        let api_key = std::env::var("TALLY_CLASSIFY_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        let model = std::env::var("TALLY_CLASSIFY_MODEL")
            .unwrap_or_else(|_| defaults::CLASSIFY_MODEL.to_string());
        let timeout_secs = std::env::var("TALLY_CLASSIFY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::CLASSIFY_TIMEOUT_SECS);

        Self {
            base_url,
            api_key,
            model,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the API credential.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClassifyConfig::default();
        assert_eq!(config.base_url, defaults::CLASSIFY_BASE_URL);
        assert!(config.api_key.is_none());
        assert_eq!(config.model, defaults::CLASSIFY_MODEL);
        assert_eq!(
            config.timeout,
            Duration::from_secs(defaults::CLASSIFY_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_config_builder_chaining() {
        let config = ClassifyConfig::default()
            .with_base_url("http://localhost:9000/v1")
            .with_api_key("sk-test")
            .with_model("test-model")
            .with_timeout(Duration::from_millis(250));
        assert_eq!(config.base_url, "http://localhost:9000/v1");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.model, "test-model");
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}
