use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::backend::{self, QueryBackend};
use crate::db::connection::{friendly_connection_error, DatabaseConnectionConfig};
use crate::db::executor::{FieldInfo, PaginationState, QueryResult, Row};
use crate::db::{guard, DbError, ErrorDiagnostics, GuardError};
use crate::llm::models::{LlmRequestConfig, RequiredInput, ResultValidation};
use crate::llm::{LlmClient, LlmError};
use crate::query::pipeline::{self, NlQuery, PipelineError, QueryOutcome};
use crate::web::state::AppState;

// Request types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    pub db_config: DatabaseConnectionConfig,
    pub llm_config: LlmRequestConfig,
    #[serde(default)]
    pub inputs: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRequest {
    pub db_config: DatabaseConnectionConfig,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub db_config: DatabaseConnectionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub query: String,
    pub db_config: DatabaseConnectionConfig,
    #[serde(default)]
    pub page: Option<u32>,
}

// Response types

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum QueryResponse {
    Query {
        success: bool,
        query: String,
        result: QueryResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        validation: Option<ResultValidation>,
        pagination: Option<PaginationState>,
    },
    Explanation {
        success: bool,
        explanation: String,
    },
    InputRequired {
        success: bool,
        required_inputs: Vec<RequiredInput>,
    },
}

impl From<QueryOutcome> for QueryResponse {
    fn from(outcome: QueryOutcome) -> Self {
        match outcome {
            QueryOutcome::Query {
                sql,
                result,
                validation,
                pagination,
            } => QueryResponse::Query {
                success: true,
                query: sql,
                result,
                validation,
                pagination,
            },
            QueryOutcome::Explanation(explanation) => QueryResponse::Explanation {
                success: true,
                explanation,
            },
            QueryOutcome::InputRequired(required_inputs) => QueryResponse::InputRequired {
                success: true,
                required_inputs,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub data: Vec<Row>,
    pub fields: Vec<FieldInfo>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub pagination: Option<PaginationState>,
}

impl From<QueryResult> for ExecuteResponse {
    fn from(result: QueryResult) -> Self {
        Self {
            success: true,
            row_count: result.row_count,
            execution_time_ms: result.execution_time_ms,
            pagination: result.pagination,
            data: result.rows,
            fields: result.fields,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionClearedResponse {
    pub success: bool,
    pub cleared: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub cached_schemas: usize,
    pub active_sessions: usize,
    pub open_pools: usize,
}

// Errors

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<ErrorDiagnostics>,
}

/// Every failure leaves the API as `{success: false, error, suggestion?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub suggestion: Option<String>,
    pub diagnostics: Option<ErrorDiagnostics>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            suggestion: None,
            diagnostics: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Connection failures reported in terms a user can act on.
    pub fn connection(err: &DbError) -> Self {
        let status = if err.is_read_only_violation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::BAD_GATEWAY
        };
        Self::new(status, friendly_connection_error(err))
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        let raw = err.to_string();
        let friendly = friendly_connection_error(&err);
        let status = match &err {
            DbError::ReadOnly(_) => StatusCode::BAD_REQUEST,
            DbError::Pool(_) | DbError::Tls(_) => StatusCode::BAD_GATEWAY,
            DbError::Postgres(e) if e.as_db_error().is_none() => StatusCode::BAD_GATEWAY,
            // auth and missing-database errors come back from the server itself
            _ if friendly != raw => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = if status == StatusCode::BAD_GATEWAY { friendly } else { raw };
        Self {
            status,
            error,
            suggestion: None,
            diagnostics: err.diagnostics(),
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        let status = match &err {
            LlmError::ConfigError(_) => StatusCode::BAD_REQUEST,
            LlmError::PromptError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LlmError::ConnectionError(_)
            | LlmError::ResponseError(_)
            | LlmError::MalformedJson(_)
            | LlmError::InvalidInputSpec(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Schema(e) => ApiError::from(e),
            PipelineError::Llm(e) => ApiError::from(e),
            PipelineError::MissingInput(message) => ApiError::bad_request(message),
            PipelineError::ReadOnly(e) => ApiError::from(e),
            PipelineError::Execution(e) => {
                let mut api = ApiError::from(e);
                api.error = format!("Query execution failed: {}", api.error);
                api
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.error,
            suggestion: self.suggestion,
            diagnostics: self.diagnostics,
        };
        (self.status, Json(body)).into_response()
    }
}

/// `Json` extractor whose rejections use the API error body.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

// API Implementations

// Natural-language query
pub async fn nl_query(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(ApiError::bad_request("Query is required"));
    }
    info!("NL query for {}: {}", payload.db_config.identity(), payload.query);
    debug!("LLM config: {:?}", payload.llm_config);

    let llm = LlmClient::from_config(&payload.llm_config, &state.config.llm)?;
    let backend = state.backend(&payload.db_config);
    let session = payload
        .session_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .map(|id| state.sessions.handle(id));

    let request = NlQuery {
        query: payload.query.clone(),
        inputs: payload.inputs.clone(),
        context: payload.context.clone(),
        page: payload.page.unwrap_or(1),
        page_size: state.config.query.page_size,
    };

    match pipeline::run_nl_query(&llm, &backend, session, &request).await {
        Ok(outcome) => Ok(Json(outcome.into())),
        Err(failure) => {
            error!("NL query failed: {}", failure);
            let message = failure.error.to_string();
            let suggestion =
                pipeline::suggest_fix(&llm, &payload.query, failure.sql.as_deref(), &message).await;
            Err(ApiError::from(failure.error).with_suggestion(suggestion))
        }
    }
}

// Schema introspection
pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<SchemaRequest>,
) -> Result<Json<Value>, ApiError> {
    let backend = state.backend(&payload.db_config);
    let schema = if payload.refresh {
        backend.refresh_schema().await
    } else {
        backend.schema().await
    }
    .map_err(|e| {
        error!("Failed to load schema for {}: {}", backend.identity(), e);
        ApiError::from(e)
    })?;

    let schema = serde_json::to_value(schema.as_ref())
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "success": true, "schema": schema })))
}

pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ConnectionRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    info!("Testing connection to {}", payload.db_config.identity());
    backend::test_connection(&payload.db_config, state.pools.settings())
        .await
        .map_err(|e| {
            warn!("Connection test failed for {}: {}", payload.db_config.identity(), e);
            ApiError::connection(&e)
        })?;
    Ok(Json(SuccessResponse { success: true }))
}

// Paged execution of client-supplied SQL
pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let sql = guard::ensure_read_only(&payload.query)?;
    let backend = state.backend(&payload.db_config);
    let result = backend
        .execute(
            &sql,
            payload.page.unwrap_or(1),
            state.config.query.execute_page_size,
        )
        .await
        .map_err(|e| {
            error!("Query execution failed: {}", e);
            ApiError::from(e)
        })?;
    Ok(Json(result.into()))
}

// Raw execution, still guarded
pub async fn execute_sql(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let sql = guard::ensure_read_only(&payload.query)?;
    let backend = state.backend(&payload.db_config);
    let result = backend.execute_unpaged(&sql).await.map_err(|e| {
        error!("Query execution failed: {}", e);
        ApiError::from(e)
    })?;
    Ok(Json(result.into()))
}

pub async fn clear_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<SessionClearedResponse> {
    let cleared = state.sessions.clear(&id);
    Json(SessionClearedResponse {
        success: true,
        cleared,
    })
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        cached_schemas: state.schema_cache.len().await,
        active_sessions: state.sessions.len(),
        open_pools: state.pools.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::executor::PaginationState;
    use serde_json::json;

    #[test]
    fn guard_errors_are_bad_requests() {
        let err = ApiError::from(guard::ensure_read_only("DROP TABLE users").unwrap_err());
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.error.contains("Write operation not permitted"));
    }

    #[test]
    fn llm_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(LlmError::ConfigError("x".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(LlmError::ConnectionError("x".into())).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(PipelineError::MissingInput("ERROR: Missing required input: date".into())).status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn aggregate_responses_carry_null_pagination() {
        let result = QueryResult {
            rows: vec![],
            fields: vec![],
            row_count: 0,
            pagination: None,
            execution_time_ms: 3,
        };
        let body = serde_json::to_value(QueryResponse::from(QueryOutcome::Query {
            sql: "SELECT count(*) FROM users".into(),
            result,
            validation: None,
            pagination: None,
        }))
        .unwrap();
        assert_eq!(body["type"], json!("query"));
        assert_eq!(body["pagination"], Value::Null);
        assert!(body.as_object().unwrap().contains_key("pagination"));
        assert!(!body.as_object().unwrap().contains_key("validation"));
        assert_eq!(body["result"], json!({"rows": [], "fields": [], "rowCount": 0}));
    }

    #[test]
    fn input_required_uses_camel_case() {
        let body = serde_json::to_value(QueryResponse::InputRequired {
            success: true,
            required_inputs: vec![],
        })
        .unwrap();
        assert_eq!(body, json!({"type": "input_required", "success": true, "requiredInputs": []}));
    }

    #[test]
    fn paged_results_carry_pagination() {
        let result = QueryResult {
            rows: vec![],
            fields: vec![],
            row_count: 0,
            pagination: Some(PaginationState::new(2, 50, 75)),
            execution_time_ms: 1,
        };
        let body = serde_json::to_value(ExecuteResponse::from(result)).unwrap();
        assert_eq!(body["pagination"]["hasMore"], json!(false));
        assert_eq!(body["pagination"]["totalPages"], json!(2));
    }
}
