//! OpenAI-compatible chat-completions backend
//!
//! Works with any endpoint exposing `POST {base_url}/chat/completions`:
//! OpenAI itself, OpenRouter, Groq, vLLM, LM Studio and the like.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sortie_core::{OracleError, OraclePrompt, ReasoningOracle};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::http::{build_client, read_json, transport_error};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleOracle {
    name: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    json_mode: bool,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatibleOracle {
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.1,
            max_tokens: 1024,
            json_mode: true,
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            client: build_client(DEFAULT_TIMEOUT)?,
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Some compatible servers reject `response_format`
    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(timeout)?;
        self.timeout = timeout;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, prompt: &OraclePrompt) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.user.clone(),
                },
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            response_format: self.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    total_tokens: Option<u32>,
}

#[async_trait]
impl ReasoningOracle for OpenAiCompatibleOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &OraclePrompt) -> std::result::Result<String, OracleError> {
        let mut builder = self.client.post(self.endpoint()).json(&self.request_body(prompt));
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| transport_error(e, self.timeout))?;
        let completion: ChatCompletionResponse = read_json(&self.name, response, self.timeout).await?;

        let tokens = completion.usage.as_ref().and_then(|u| u.total_tokens).unwrap_or(0);
        tracing::debug!(provider = %self.name, model = %self.model, tokens, "oracle completion");

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| OracleError::Malformed(format!("{} returned no choices", self.name)))
    }
}
