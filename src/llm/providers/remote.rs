use crate::config::LlmSettings;
use crate::llm::models::LlmRequestConfig;
use crate::llm::{LlmError, LlmProvider};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Any OpenAI-compatible chat completions endpoint: OpenRouter, OpenAI or a
/// custom gateway.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    name: &'static str,
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl RemoteLlmProvider {
    pub fn openrouter(config: &LlmRequestConfig, settings: &LlmSettings) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                LlmError::ConfigError("API key is required for the openrouter provider".to_string())
            })?;

        let mut headers = extra_headers(config)?;
        headers.insert("HTTP-Referer", header_value(&settings.app_url)?);
        headers.insert("X-Title", header_value(&settings.app_name)?);

        let api_url = config
            .base_url
            .clone()
            .map(|base| chat_completions_url(&base))
            .unwrap_or_else(|| settings.openrouter_url.clone());

        Self::build("openrouter", api_url, Some(api_key), headers, config, settings)
    }

    pub fn openai_compatible(config: &LlmRequestConfig, settings: &LlmSettings) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                LlmError::ConfigError(format!(
                    "baseUrl is required for the {} provider",
                    config.provider
                ))
            })?;

        let mut headers = extra_headers(config)?;
        if let Some(org) = config.organization.as_deref() {
            headers.insert("OpenAI-Organization", header_value(org)?);
        }

        Self::build(
            "openai-compatible",
            chat_completions_url(base_url),
            config.api_key.clone().filter(|k| !k.trim().is_empty()),
            headers,
            config,
            settings,
        )
    }

    fn build(
        name: &'static str,
        api_url: String,
        api_key: Option<String>,
        headers: HeaderMap,
        config: &LlmRequestConfig,
        settings: &LlmSettings,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            name,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature.unwrap_or(settings.temperature),
            max_tokens: settings.max_tokens,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

/// Accepts either a base URL or the full completions URL.
fn chat_completions_url(base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn header_value(value: &str) -> Result<HeaderValue, LlmError> {
    HeaderValue::from_str(value)
        .map_err(|e| LlmError::ConfigError(format!("Invalid header value: {e}")))
}

fn extra_headers(config: &LlmRequestConfig) -> Result<HeaderMap, LlmError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| LlmError::ConfigError(format!("Invalid header name {name}: {e}")))?;
        headers.insert(name, header_value(value)?);
    }
    Ok(headers)
}

#[async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = PromptRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!("Sending request to {} with model {}", self.api_url, self.model);

        let mut builder = self.client.post(&self.api_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("{} responded with status code {}: {}", self.name, status, body);
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {status}"
            )));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        prompt_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ResponseError("No choices in response".to_string()))
    }

    fn name(&self) -> &str {
        self.name
    }
}
