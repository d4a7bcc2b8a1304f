//! Ordered fallback across providers

use async_trait::async_trait;
use sortie_core::{OracleError, OraclePrompt, ReasoningOracle};
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, GuardedOracle};
use crate::config::{OracleConfig, ProviderConfig};
use crate::error::{ConfigError, Result};
use crate::ollama::OllamaOracle;
use crate::openai_compatible::OpenAiCompatibleOracle;

/// Tries each provider in order and returns the first answer.
///
/// Every provider sits behind its own circuit breaker, so a dead provider
/// costs one fast failure instead of a timeout per command.
#[derive(Debug)]
pub struct OracleChain {
    providers: Vec<GuardedOracle>,
}

impl OracleChain {
    pub fn new(providers: Vec<Arc<dyn ReasoningOracle>>, breaker: CircuitBreakerConfig) -> Result<Self> {
        if providers.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(Self {
            providers: providers
                .into_iter()
                .map(|p| GuardedOracle::new(p, breaker.clone()))
                .collect(),
        })
    }

    /// Build from configuration, reading API keys from the process environment
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        Self::from_config_with(config, |name| std::env::var(name).ok())
    }

    pub fn from_config_with<F>(config: &OracleConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut providers: Vec<Arc<dyn ReasoningOracle>> = Vec::new();
        for name in config.order()? {
            let Some(provider) = config.providers.get(name) else {
                return Err(ConfigError::UnknownProvider(name.to_string()));
            };
            let api_key = provider.api_key(name, &lookup)?;
            let oracle: Arc<dyn ReasoningOracle> = match provider {
                ProviderConfig::OpenAiCompatible {
                    base_url,
                    model,
                    temperature,
                    max_tokens,
                    json_mode,
                    headers,
                    ..
                } => {
                    let mut client = OpenAiCompatibleOracle::new(name, api_key, base_url.clone(), model.clone())?
                        .with_json_mode(*json_mode)
                        .with_timeout(config.timeout())?;
                    if let Some(value) = *temperature {
                        client = client.with_temperature(value);
                    }
                    if let Some(value) = *max_tokens {
                        client = client.with_max_tokens(value);
                    }
                    for (key, value) in headers {
                        client = client.with_header(key.clone(), value.clone());
                    }
                    Arc::new(client)
                }
                ProviderConfig::Ollama {
                    base_url,
                    model,
                    temperature,
                } => {
                    let mut client =
                        OllamaOracle::new(name, base_url.clone(), model.clone())?.with_timeout(config.timeout())?;
                    if let Some(value) = *temperature {
                        client = client.with_temperature(value);
                    }
                    Arc::new(client)
                }
            };
            tracing::debug!(provider = name, "oracle provider configured");
            providers.push(oracle);
        }
        Self::new(providers, config.circuit_breaker.clone())
    }

    /// Provider names in call order
    pub fn providers(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.providers
            .iter()
            .find(|p| p.name() == provider)
            .map(GuardedOracle::breaker)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl ReasoningOracle for OracleChain {
    fn name(&self) -> &str {
        self.providers.first().map(|p| p.name()).unwrap_or("chain")
    }

    async fn complete(&self, prompt: &OraclePrompt) -> std::result::Result<String, OracleError> {
        let mut failures: Vec<(String, OracleError)> = Vec::new();
        for provider in &self.providers {
            match provider.complete(prompt).await {
                Ok(text) => {
                    if !failures.is_empty() {
                        tracing::info!(provider = provider.name(), skipped = failures.len(), "oracle answered after fallback");
                    }
                    return Ok(text);
                }
                Err(err) => {
                    tracing::warn!(provider = provider.name(), error = %err, "oracle provider failed");
                    failures.push((provider.name().to_string(), err));
                }
            }
        }

        if failures.len() == 1 {
            if let Some((_, err)) = failures.pop() {
                return Err(err);
            }
        }
        let summary: Vec<String> = failures
            .iter()
            .map(|(name, err)| format!("{}: {}", name, err))
            .collect();
        Err(OracleError::Unavailable(format!(
            "all oracle providers failed ({})",
            summary.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::testing::{prompt, Flaky, StubServer};
    use std::sync::atomic::Ordering;

    fn breaker(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            ..CircuitBreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn falls_through_to_the_next_provider() {
        let primary = Arc::new(Flaky::failing("primary", OracleError::RateLimited("429".into())));
        let backup = Arc::new(Flaky::answering("backup", r#"{"actions":[]}"#));
        let chain = OracleChain::new(vec![primary.clone(), backup.clone()], breaker(5)).unwrap();

        assert_eq!(chain.complete(&prompt()).await.unwrap(), r#"{"actions":[]}"#);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.providers(), vec!["primary", "backup"]);
    }

    #[tokio::test]
    async fn all_failures_are_summarised() {
        let chain = OracleChain::new(
            vec![
                Arc::new(Flaky::failing("a", OracleError::Timeout(30_000))),
                Arc::new(Flaky::failing("b", OracleError::Unavailable("refused".into()))),
            ],
            breaker(5),
        )
        .unwrap();

        match chain.complete(&prompt()).await {
            Err(OracleError::Unavailable(message)) => {
                assert!(message.contains("a: Oracle timed out"));
                assert!(message.contains("b: Oracle unavailable: refused"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn single_provider_keeps_its_error_class() {
        let chain = OracleChain::new(vec![Arc::new(Flaky::failing("only", OracleError::RateLimited("429".into())))], breaker(5))
            .unwrap();
        assert!(matches!(chain.complete(&prompt()).await, Err(OracleError::RateLimited(_))));
    }

    #[tokio::test]
    async fn dead_provider_is_skipped_once_its_circuit_opens() {
        let dead = Arc::new(Flaky::failing("dead", OracleError::Unavailable("refused".into())));
        let alive = Arc::new(Flaky::answering("alive", "{}"));
        let chain = OracleChain::new(vec![dead.clone(), alive], breaker(2)).unwrap();

        for _ in 0..4 {
            assert!(chain.complete(&prompt()).await.is_ok());
        }
        assert_eq!(dead.calls.load(Ordering::SeqCst), 2);
        assert_eq!(chain.breaker("dead").map(|b| b.state()), Some(CircuitState::Open));
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(matches!(OracleChain::new(Vec::new(), breaker(5)), Err(ConfigError::Empty)));
    }

    #[tokio::test]
    async fn built_from_config_talks_to_the_configured_endpoint() {
        let server = StubServer::respond(200, r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#).await;
        let config = OracleConfig::from_json_str(&format!(
            r#"{{"default": "lab", "providers": {{"lab": {{"type": "openai_compatible", "base_url": "{}", "model": "m", "api_key_env": "LAB_KEY"}}}}}}"#,
            server.url()
        ))
        .unwrap();

        let chain = OracleChain::from_config_with(&config, |name| (name == "LAB_KEY").then(|| "k".to_string())).unwrap();
        assert_eq!(chain.complete(&prompt()).await.unwrap(), "ok");
        assert!(server.request().await.to_lowercase().contains("authorization: bearer k"));

        let missing = OracleChain::from_config_with(&config, |_| None);
        assert!(matches!(missing, Err(ConfigError::MissingApiKey { .. })));
    }
}
