//! Local Ollama backend (`POST /api/generate`, non-streaming)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sortie_core::{OracleError, OraclePrompt, ReasoningOracle};
use std::time::Duration;

use crate::error::Result;
use crate::http::{build_client, read_json, transport_error};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local models are slow to load on first use
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OllamaOracle {
    name: String,
    base_url: String,
    model: String,
    temperature: f64,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaOracle {
    pub fn new(name: impl Into<String>, base_url: Option<String>, model: impl Into<String>) -> Result<Self> {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.1,
            timeout: DEFAULT_TIMEOUT,
            client: build_client(DEFAULT_TIMEOUT)?,
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(timeout)?;
        self.timeout = timeout;
        Ok(self)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'static str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[async_trait]
impl ReasoningOracle for OllamaOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &OraclePrompt) -> std::result::Result<String, OracleError> {
        let body = GenerateRequest {
            model: &self.model,
            system: &prompt.system,
            prompt: &prompt.user,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let generated: GenerateResponse = read_json(&self.name, response, self.timeout).await?;

        tracing::debug!(provider = %self.name, model = %self.model, tokens = generated.eval_count.unwrap_or(0), "oracle completion");
        Ok(generated.response)
    }
}
