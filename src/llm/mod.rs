pub mod models;
pub mod prompts;
pub mod providers;

use crate::config::LlmSettings;
use crate::llm::models::{
    parse_classification, parse_entities, parse_required_inputs, parse_validation, LlmRequestConfig,
    ProviderKind, QueryIntent, RequiredInput, ResultValidation,
};
use async_trait::async_trait;
use minijinja::context;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Prefix the SQL generator returns instead of SQL when an input is missing.
pub const MISSING_INPUT_SENTINEL: &str = "ERROR: Missing required input";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
    #[error("Prompt rendering error: {0}")]
    PromptError(String),
    #[error("LLM returned malformed JSON: {0}")]
    MalformedJson(String),
    #[error("LLM returned an invalid input specification: {0}")]
    InvalidInputSpec(String),
}

/// A completion backend: one prompt in, raw model text out.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    fn name(&self) -> &str;
}

/// Request-scoped client running the prompt templates against one provider.
///
/// Built per request from the caller's `llmConfig`; never stored in shared state.
pub struct LlmClient {
    provider: Box<dyn LlmProvider>,
}

impl LlmClient {
    pub fn from_config(config: &LlmRequestConfig, settings: &LlmSettings) -> Result<Self, LlmError> {
        let provider: Box<dyn LlmProvider> = match config.provider_kind()? {
            ProviderKind::OpenRouter => {
                Box::new(providers::remote::RemoteLlmProvider::openrouter(config, settings)?)
            }
            ProviderKind::OpenAiCompatible => {
                Box::new(providers::remote::RemoteLlmProvider::openai_compatible(config, settings)?)
            }
            ProviderKind::Ollama => Box::new(providers::ollama::OllamaProvider::new(config, settings)?),
        };

        info!("Using LLM provider {} with model {}", provider.name(), config.model);
        Ok(Self { provider })
    }

    pub fn with_provider(provider: Box<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Decides whether the question needs a query, an explanation or more input.
    pub async fn classify(
        &self,
        schema: &str,
        query: &str,
        context: Option<&str>,
    ) -> Result<QueryIntent, LlmError> {
        let prompt = prompts::render(
            prompts::CLASSIFY,
            context! { schema, query, context => context.unwrap_or_default() },
        )?;
        let reply = self.provider.complete(&prompt).await?;
        let intent = parse_classification(&reply);
        info!("Classified query as {:?}", intent);
        Ok(intent)
    }

    /// Asks which named, typed values must be collected from the user.
    pub async fn elicit_inputs(
        &self,
        schema: &str,
        query: &str,
        context: Option<&str>,
    ) -> Result<Vec<RequiredInput>, LlmError> {
        let prompt = prompts::render(
            prompts::ELICIT_INPUTS,
            context! { schema, query, context => context.unwrap_or_default() },
        )?;
        let reply = self.provider.complete(&prompt).await?;
        parse_required_inputs(&reply)
    }

    /// Returns one raw SQL statement, or a string starting with
    /// [`MISSING_INPUT_SENTINEL`] when the model lacks a required value.
    pub async fn generate_sql(
        &self,
        schema: &str,
        query: &str,
        inputs: Option<&BTreeMap<String, serde_json::Value>>,
        context: Option<&str>,
    ) -> Result<String, LlmError> {
        let inputs: Vec<(String, String)> = inputs
            .map(|map| {
                map.iter()
                    .map(|(name, value)| (name.clone(), display_input(value)))
                    .collect()
            })
            .unwrap_or_default();

        let prompt = prompts::render(
            prompts::GENERATE_SQL,
            context! {
                schema,
                query,
                inputs,
                context => context.unwrap_or_default(),
                sentinel => MISSING_INPUT_SENTINEL,
            },
        )?;
        let reply = self.provider.complete(&prompt).await?;
        let sql = reply.trim().to_string();
        debug!("Generated SQL: {}", sql);

        if sql.is_empty() {
            return Err(LlmError::ResponseError("Model returned an empty response".to_string()));
        }
        Ok(sql)
    }

    /// Answers questions that need no query.
    pub async fn explain(
        &self,
        schema: &str,
        query: &str,
        context: Option<&str>,
    ) -> Result<String, LlmError> {
        let prompt = prompts::render(
            prompts::EXPLAIN_QUERY,
            context! { schema, query, context => context.unwrap_or_default() },
        )?;
        Ok(self.provider.complete(&prompt).await?.trim().to_string())
    }

    /// Judges whether the returned rows answer the question.
    pub async fn validate_result(
        &self,
        query: &str,
        sql: &str,
        sample: &[serde_json::Map<String, serde_json::Value>],
        row_count: usize,
    ) -> Result<ResultValidation, LlmError> {
        let sample = serde_json::to_string_pretty(sample)
            .map_err(|e| LlmError::PromptError(e.to_string()))?;
        let prompt = prompts::render(
            prompts::VALIDATE_RESULT,
            context! { query, sql, sample, row_count },
        )?;
        let reply = self.provider.complete(&prompt).await?;
        parse_validation(&reply)
    }

    /// Explains a failure in plain language with a suggested fix.
    pub async fn explain_error(
        &self,
        query: &str,
        sql: Option<&str>,
        error: &str,
    ) -> Result<String, LlmError> {
        let prompt = prompts::render(
            prompts::EXPLAIN_ERROR,
            context! { query, sql => sql.unwrap_or_default(), error },
        )?;
        Ok(self.provider.complete(&prompt).await?.trim().to_string())
    }

    /// Business entities mentioned by the question, used to rank prior context.
    pub async fn identify_entities(&self, schema: &str, query: &str) -> Result<Vec<String>, LlmError> {
        let prompt = prompts::render(prompts::IDENTIFY_ENTITIES, context! { schema, query })?;
        let reply = self.provider.complete(&prompt).await?;
        parse_entities(&reply)
    }
}

fn display_input(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
