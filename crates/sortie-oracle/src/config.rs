//! Oracle provider configuration
//!
//! ```toml
//! default = "openrouter"
//! fallbacks = ["local"]
//! timeout_secs = 30
//!
//! [providers.openrouter]
//! type = "openai_compatible"
//! base_url = "https://openrouter.ai/api/v1"
//! model = "meta-llama/llama-3.1-70b-instruct"
//! api_key_env = "OPENROUTER_API_KEY"
//!
//! [providers.local]
//! type = "ollama"
//! model = "llama3.1"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Tried first
    #[serde(default)]
    pub default: Option<String>,

    /// Tried in order after the default
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Per-request timeout applied to every provider
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            default: None,
            fallbacks: Vec::new(),
            timeout_secs: default_timeout_secs(),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible {
        base_url: String,
        model: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default = "default_json_mode")]
        json_mode: bool,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Ollama {
        #[serde(default)]
        base_url: Option<String>,
        model: String,
        #[serde(default)]
        temperature: Option<f64>,
    },
}

fn default_json_mode() -> bool {
    true
}

impl OracleConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a `.json` or `.toml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Provider names in call order: default, then fallbacks, duplicates
    /// dropped. Without either, every configured provider in name order.
    pub fn order(&self) -> Result<Vec<&str>> {
        let mut order: Vec<&str> = Vec::new();
        for name in self.default.iter().chain(self.fallbacks.iter()) {
            if !self.providers.contains_key(name) {
                return Err(ConfigError::UnknownProvider(name.clone()));
            }
            if !order.contains(&name.as_str()) {
                order.push(name.as_str());
            }
        }
        if order.is_empty() {
            order.extend(self.providers.keys().map(String::as_str));
        }
        if order.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(order)
    }
}

impl ProviderConfig {
    /// API key: inline value first, then the named environment variable
    pub(crate) fn api_key<F>(&self, provider: &str, lookup: &F) -> Result<Option<String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            ProviderConfig::OpenAiCompatible {
                api_key, api_key_env, ..
            } => {
                if let Some(key) = api_key {
                    return Ok(Some(key.clone()));
                }
                match api_key_env {
                    Some(variable) => lookup(variable).filter(|k| !k.is_empty()).map(Some).ok_or_else(|| {
                        ConfigError::MissingApiKey {
                            provider: provider.to_string(),
                            variable: variable.clone(),
                        }
                    }),
                    None => Ok(None),
                }
            }
            ProviderConfig::Ollama { .. } => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TOML: &str = r#"
        default = "openrouter"
        fallbacks = ["local", "openrouter"]
        timeout_secs = 10

        [circuit_breaker]
        failure_threshold = 2

        [providers.openrouter]
        type = "openai_compatible"
        base_url = "https://openrouter.ai/api/v1"
        model = "meta-llama/llama-3.1-70b-instruct"
        api_key_env = "OPENROUTER_API_KEY"

        [providers.local]
        type = "ollama"
        model = "llama3.1"
    "#;

    #[test]
    fn toml_config_orders_default_then_fallbacks() {
        let config = OracleConfig::from_toml_str(TOML).unwrap();
        assert_eq!(config.order().unwrap(), vec!["openrouter", "local"]);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
    }

    #[test]
    fn json_config_without_order_uses_every_provider() {
        let config = OracleConfig::from_json_str(
            r#"{"providers": {
                "b": {"type": "ollama", "model": "phi3"},
                "a": {"type": "openai_compatible", "base_url": "http://localhost:8000/v1", "model": "qwen"}
            }}"#,
        )
        .unwrap();
        assert_eq!(config.order().unwrap(), vec!["a", "b"]);
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn unknown_or_missing_providers_are_rejected() {
        let config = OracleConfig {
            default: Some("ghost".into()),
            ..OracleConfig::default()
        };
        assert!(matches!(config.order(), Err(ConfigError::UnknownProvider(name)) if name == "ghost"));
        assert!(matches!(OracleConfig::default().order(), Err(ConfigError::Empty)));
    }

    #[test]
    fn api_key_comes_from_the_named_variable() {
        let config = OracleConfig::from_toml_str(TOML).unwrap();
        let provider = &config.providers["openrouter"];

        let key = provider
            .api_key("openrouter", &|name| (name == "OPENROUTER_API_KEY").then(|| "sk-or".to_string()))
            .unwrap();
        assert_eq!(key.as_deref(), Some("sk-or"));

        let missing = provider.api_key("openrouter", &|_| None);
        assert!(matches!(missing, Err(ConfigError::MissingApiKey { variable, .. }) if variable == "OPENROUTER_API_KEY"));
    }

    #[test]
    fn loads_from_file_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(TOML.as_bytes()).unwrap();
        let config = OracleConfig::from_file(file.path()).unwrap();
        assert_eq!(config.providers.len(), 2);
    }
}
