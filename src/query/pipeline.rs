use crate::db::backend::QueryBackend;
use crate::db::executor::{PaginationState, QueryResult};
use crate::db::guard::{self, GuardError};
use crate::db::schema::DatabaseSchema;
use crate::db::DbError;
use crate::llm::models::{QueryIntent, RequiredInput, ResultValidation};
use crate::llm::{LlmClient, LlmError, MISSING_INPUT_SENTINEL};
use crate::query::context::{detect_references, ConversationContext, QueryContext};
use crate::query::session::SessionHandle;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

const VALIDATION_SAMPLE_ROWS: usize = 10;
const CONTEXT_SAMPLE_ROWS: usize = 5;
pub const NO_SUGGESTION: &str = "No suggestion available";

/// A natural-language question plus whatever the client already collected.
#[derive(Debug, Clone, Default)]
pub struct NlQuery {
    pub query: String,
    pub inputs: Option<BTreeMap<String, Value>>,
    pub context: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl NlQuery {
    fn has_inputs(&self) -> bool {
        self.inputs.as_ref().is_some_and(|inputs| !inputs.is_empty())
    }
}

#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Query {
        sql: String,
        result: QueryResult,
        validation: Option<ResultValidation>,
        pagination: Option<PaginationState>,
    },
    Explanation(String),
    InputRequired(Vec<RequiredInput>),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load database schema: {0}")]
    Schema(#[source] DbError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("{0}")]
    MissingInput(String),
    #[error(transparent)]
    ReadOnly(#[from] GuardError),
    #[error("Query execution failed: {0}")]
    Execution(#[source] DbError),
}

/// A failed run, keeping the SQL that was generated before the failure.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub sql: Option<String>,
}

impl PipelineFailure {
    fn new(error: impl Into<PipelineError>, sql: Option<&str>) -> Self {
        Self {
            error: error.into(),
            sql: sql.map(str::to_string),
        }
    }
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

#[derive(Default)]
struct Attempt {
    intent: Option<QueryIntent>,
    entities: Vec<String>,
}

/// Answers a question end to end and records the attempt in the session.
///
/// Explanations and input requests are returned without touching history;
/// generated queries are recorded whether they succeed or fail.
pub async fn run_nl_query(
    llm: &LlmClient,
    backend: &dyn QueryBackend,
    session: Option<SessionHandle<'_>>,
    request: &NlQuery,
) -> Result<QueryOutcome, PipelineFailure> {
    let mut attempt = Attempt::default();
    let outcome = answer(llm, backend, session, request, &mut attempt).await;

    if let Some(session) = session {
        let record = match &outcome {
            Ok(QueryOutcome::Query { sql, result, .. }) => Some(QueryContext::success(
                &request.query,
                sql,
                result.sample(CONTEXT_SAMPLE_ROWS),
            )),
            Err(failure) => Some(QueryContext::failure(
                &request.query,
                failure.sql.as_deref(),
                &failure.to_string(),
            )),
            Ok(_) => None,
        };

        if let Some(record) = record {
            let record = record.with_entities(attempt.entities);
            let record = match attempt.intent {
                Some(intent) => record.with_intent(intent.as_str()),
                None => record,
            };
            session.record(record);
        }
    }

    outcome
}

async fn answer(
    llm: &LlmClient,
    backend: &dyn QueryBackend,
    session: Option<SessionHandle<'_>>,
    request: &NlQuery,
    attempt: &mut Attempt,
) -> Result<QueryOutcome, PipelineFailure> {
    let schema = backend
        .schema()
        .await
        .map_err(|e| PipelineFailure::new(PipelineError::Schema(e), None))?;
    let schema_text = schema.to_prompt_text();

    let history = session.map(|s| s.snapshot());
    let context = build_context(llm, &schema, &schema_text, history.as_ref(), request, attempt).await;
    let context = context.as_deref();

    if request.has_inputs() {
        info!("Inputs supplied, skipping classification");
    } else {
        let intent = llm
            .classify(&schema_text, &request.query, context)
            .await
            .map_err(|e| PipelineFailure::new(e, None))?;
        attempt.intent = Some(intent);

        match intent {
            QueryIntent::NeedsInput => {
                let required = llm
                    .elicit_inputs(&schema_text, &request.query, context)
                    .await
                    .map_err(|e| PipelineFailure::new(e, None))?;
                if !required.is_empty() {
                    info!("Requesting {} inputs from the user", required.len());
                    return Ok(QueryOutcome::InputRequired(required));
                }
                info!("Classifier asked for input but none were listed, generating SQL");
            }
            QueryIntent::NeedsExplanation => {
                let explanation = llm
                    .explain(&schema_text, &request.query, context)
                    .await
                    .map_err(|e| PipelineFailure::new(e, None))?;
                return Ok(QueryOutcome::Explanation(explanation));
            }
            QueryIntent::NeedsQuery => {}
        }
    }

    let generated = llm
        .generate_sql(&schema_text, &request.query, request.inputs.as_ref(), context)
        .await
        .map_err(|e| PipelineFailure::new(e, None))?;

    // models often fence the sentinel like any other reply
    let cleaned = guard::clean_sql(&generated);
    if cleaned.starts_with(MISSING_INPUT_SENTINEL) {
        warn!("SQL generation reported a missing input: {}", cleaned);
        return Err(PipelineFailure::new(PipelineError::MissingInput(cleaned), None));
    }

    let sql = guard::ensure_read_only(&generated)
        .map_err(|e| PipelineFailure::new(e, Some(generated.as_str())))?;

    let result = backend
        .execute(&sql, request.page.max(1), request.page_size)
        .await
        .map_err(|e| PipelineFailure::new(PipelineError::Execution(e), Some(sql.as_str())))?;

    let validation = match llm
        .validate_result(
            &request.query,
            &sql,
            &result.sample(VALIDATION_SAMPLE_ROWS),
            result.row_count,
        )
        .await
    {
        Ok(validation) => Some(validation),
        Err(e) => {
            warn!("Result validation failed: {}", e);
            None
        }
    };

    Ok(QueryOutcome::Query {
        pagination: result.pagination,
        sql,
        result,
        validation,
    })
}

/// Session summary followed by the client-supplied context.
async fn build_context(
    llm: &LlmClient,
    schema: &DatabaseSchema,
    schema_text: &str,
    history: Option<&ConversationContext>,
    request: &NlQuery,
    attempt: &mut Attempt,
) -> Option<String> {
    let mut sections = Vec::new();

    if let Some(history) = history.filter(|h| !h.is_empty()) {
        attempt.entities = match llm.identify_entities(schema_text, &request.query).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!("Entity identification failed: {}", e);
                Vec::new()
            }
        };
        let detected = detect_references(&request.query, schema);
        if let Some(summary) = history.get_query_context(&request.query, &detected, &attempt.entities) {
            sections.push(summary);
        }
    }

    if let Some(client) = request.context.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        sections.push(client.to_string());
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Plain-language advice for a failure; never fails itself.
pub async fn suggest_fix(llm: &LlmClient, query: &str, sql: Option<&str>, error: &str) -> String {
    match llm.explain_error(query, sql, error).await {
        Ok(suggestion) if !suggestion.is_empty() => suggestion,
        Ok(_) => NO_SUGGESTION.to_string(),
        Err(e) => {
            warn!("Could not produce a suggestion: {}", e);
            NO_SUGGESTION.to_string()
        }
    }
}
