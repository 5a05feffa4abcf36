use crate::llm::LlmError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::warn;

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"));

/// LLM settings supplied by the caller with every request.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequestConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl std::fmt::Debug for LlmRequestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRequestConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "********"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenRouter,
    Ollama,
    OpenAiCompatible,
}

impl LlmRequestConfig {
    pub fn provider_kind(&self) -> Result<ProviderKind, LlmError> {
        match self.provider.trim().to_lowercase().as_str() {
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "ollama" | "self-hosted" => Ok(ProviderKind::Ollama),
            "openai" | "custom" => Ok(ProviderKind::OpenAiCompatible),
            other => Err(LlmError::ConfigError(format!(
                "Unsupported LLM provider: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Text,
    Number,
    Date,
}

/// A value the user must provide before SQL can be generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredInput {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    pub example: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryIntent {
    NeedsQuery,
    NeedsExplanation,
    NeedsInput,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::NeedsQuery => "NEEDS_QUERY",
            QueryIntent::NeedsExplanation => "NEEDS_EXPLANATION",
            QueryIntent::NeedsInput => "NEEDS_INPUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultValidation {
    pub is_valid: bool,
    pub explanation: String,
}

/// Drops a surrounding markdown code fence, if any.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // skip the language tag on the opening fence line
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Reads a classifier reply. `NEEDS_INPUT` wins when several labels appear;
/// anything unrecognised is treated as a query.
pub fn parse_classification(reply: &str) -> QueryIntent {
    let upper = reply.to_uppercase();
    if upper.contains("NEEDS_INPUT") {
        QueryIntent::NeedsInput
    } else if upper.contains("NEEDS_EXPLANATION") {
        QueryIntent::NeedsExplanation
    } else if upper.contains("NEEDS_QUERY") || upper.contains("READY") {
        QueryIntent::NeedsQuery
    } else {
        warn!("Unrecognised classification {:?}, assuming NEEDS_QUERY", reply.trim());
        QueryIntent::NeedsQuery
    }
}

fn parse_json(reply: &str) -> Result<Value, LlmError> {
    serde_json::from_str(strip_code_fence(reply)).map_err(|e| LlmError::MalformedJson(e.to_string()))
}

fn non_empty_field<'a>(item: &'a serde_json::Map<String, Value>, field: &str) -> Option<&'a str> {
    item.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn parse_required_inputs(reply: &str) -> Result<Vec<RequiredInput>, LlmError> {
    let value = parse_json(reply)?;
    let Value::Array(items) = value else {
        return Err(LlmError::InvalidInputSpec("expected a JSON array".to_string()));
    };

    let mut inputs = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Some(item) = item.as_object() else {
            return Err(LlmError::InvalidInputSpec(format!(
                "item {index} is not an object"
            )));
        };

        let missing: Vec<&str> = ["name", "description", "type", "example"]
            .into_iter()
            .filter(|field| non_empty_field(item, field).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(LlmError::InvalidInputSpec(format!(
                "item {index} is missing {}",
                missing.join(", ")
            )));
        }

        let name = non_empty_field(item, "name").unwrap_or_default();
        let description = non_empty_field(item, "description").unwrap_or_default();
        let example = non_empty_field(item, "example").unwrap_or_default();
        let input_type = match non_empty_field(item, "type").unwrap_or_default().to_lowercase().as_str() {
            "text" => InputType::Text,
            "number" => InputType::Number,
            "date" => InputType::Date,
            other => {
                return Err(LlmError::InvalidInputSpec(format!(
                    "item {index} has unsupported type {other:?}"
                )));
            }
        };

        if input_type == InputType::Date && !ISO_DATE.is_match(example) {
            return Err(LlmError::InvalidInputSpec(format!(
                "item {index} has a date example {example:?} not in YYYY-MM-DD form"
            )));
        }

        inputs.push(RequiredInput {
            name: name.to_string(),
            description: description.to_string(),
            input_type,
            example: example.to_string(),
        });
    }

    Ok(inputs)
}

pub fn parse_validation(reply: &str) -> Result<ResultValidation, LlmError> {
    let value = parse_json(reply)?;
    serde_json::from_value(value).map_err(|e| LlmError::ResponseError(e.to_string()))
}

/// Accepts either a JSON array of strings or one entity per line.
pub fn parse_entities(reply: &str) -> Result<Vec<String>, LlmError> {
    let body = strip_code_fence(reply);
    if body.starts_with('[') {
        let entities: Vec<String> =
            serde_json::from_str(body).map_err(|e| LlmError::MalformedJson(e.to_string()))?;
        return Ok(entities
            .into_iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect());
    }

    Ok(body
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*']).trim().to_lowercase())
        .filter(|line| !line.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_case_insensitive_and_input_wins() {
        assert_eq!(parse_classification("needs_query"), QueryIntent::NeedsQuery);
        assert_eq!(parse_classification("READY"), QueryIntent::NeedsQuery);
        assert_eq!(parse_classification(" Needs_Explanation\n"), QueryIntent::NeedsExplanation);
        assert_eq!(
            parse_classification("NEEDS_QUERY, but really NEEDS_INPUT"),
            QueryIntent::NeedsInput
        );
        assert_eq!(parse_classification("I am not sure"), QueryIntent::NeedsQuery);
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("```\n[]\n```  "), "[]");
        assert_eq!(strip_code_fence("  [] "), "[]");
    }

    #[test]
    fn parses_valid_input_specs() {
        let reply = r#"```json
[{"name": "start_date", "description": "Start of the week", "type": "date", "example": "2024-05-01"},
 {"name": "min_total", "description": "Minimum order total", "type": "number", "example": "100"}]
```"#;
        let inputs = parse_required_inputs(reply).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].input_type, InputType::Date);
        assert_eq!(inputs[1].name, "min_total");
    }

    #[test]
    fn syntax_errors_are_malformed_json() {
        let err = parse_required_inputs("[{\"name\": ").unwrap_err();
        assert!(matches!(err, LlmError::MalformedJson(_)));
    }

    #[test]
    fn structural_errors_name_the_index_and_fields() {
        let err = parse_required_inputs(
            r#"[{"name": "a", "description": "d", "type": "text", "example": "x"}, {"name": "b", "type": "text"}]"#,
        )
        .unwrap_err();
        match err {
            LlmError::InvalidInputSpec(msg) => {
                assert!(msg.contains("item 1"), "{msg}");
                assert!(msg.contains("description"), "{msg}");
                assert!(msg.contains("example"), "{msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_non_arrays_bad_types_and_bad_dates() {
        assert!(matches!(
            parse_required_inputs(r#"{"name": "a"}"#),
            Err(LlmError::InvalidInputSpec(_))
        ));
        assert!(matches!(
            parse_required_inputs("[42]"),
            Err(LlmError::InvalidInputSpec(_))
        ));
        assert!(matches!(
            parse_required_inputs(r#"[{"name": "a", "description": "d", "type": "boolean", "example": "true"}]"#),
            Err(LlmError::InvalidInputSpec(_))
        ));
        assert!(matches!(
            parse_required_inputs(r#"[{"name": "a", "description": "d", "type": "date", "example": "last week"}]"#),
            Err(LlmError::InvalidInputSpec(_))
        ));
    }

    #[test]
    fn empty_array_is_no_inputs() {
        assert!(parse_required_inputs("[]").unwrap().is_empty());
    }

    #[test]
    fn parses_validation_reply() {
        let v = parse_validation("```json\n{\"isValid\": false, \"explanation\": \"No rows\"}\n```").unwrap();
        assert!(!v.is_valid);
        assert_eq!(v.explanation, "No rows");
    }

    #[test]
    fn parses_entities_in_both_shapes() {
        assert_eq!(parse_entities(r#"["Customers", " orders "]"#).unwrap(), vec!["customers", "orders"]);
        assert_eq!(parse_entities("- Invoices\n- payments\n").unwrap(), vec!["invoices", "payments"]);
    }

    #[test]
    fn provider_names_map_to_kinds() {
        let mut config: LlmRequestConfig =
            serde_json::from_str(r#"{"provider": "OpenRouter", "model": "m", "apiKey": "k"}"#).unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::OpenRouter);
        config.provider = "custom".into();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::OpenAiCompatible);
        config.provider = "ollama".into();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Ollama);
        assert!(!format!("{config:?}").contains("\"k\""));
    }
}
