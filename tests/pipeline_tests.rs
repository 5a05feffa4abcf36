use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nl_pg::db::executor::{is_aggregate_query, FieldInfo, PaginationState, QueryResult, Row};
use nl_pg::db::schema::DatabaseSchema;
use nl_pg::db::{DbError, QueryBackend};
use nl_pg::llm::models::InputType;
use nl_pg::llm::{LlmClient, LlmError, LlmProvider, MISSING_INPUT_SENTINEL};
use nl_pg::query::pipeline::{run_nl_query, suggest_fix, NlQuery, PipelineError, QueryOutcome, NO_SUGGESTION};
use nl_pg::query::session::SessionRegistry;

/// Answers each prompt by recognising which template produced it.
struct ScriptedLlm {
    classify: String,
    elicit: String,
    generate: String,
    validate: String,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    fn new(classify: &str, generate: &str) -> Self {
        Self {
            classify: classify.to_string(),
            elicit: "[]".to_string(),
            generate: generate.to_string(),
            validate: r#"{"isValid": true, "explanation": "Rows match the question"}"#.to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_elicit(mut self, reply: &str) -> Self {
        self.elicit = reply.to_string();
        self
    }

    fn with_validate(mut self, reply: &str) -> Self {
        self.validate = reply.to_string();
        self
    }

    fn into_client(self) -> (LlmClient, Arc<Mutex<Vec<String>>>) {
        let prompts = Arc::clone(&self.prompts);
        (LlmClient::with_provider(Box::new(self)), prompts)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().push(prompt.to_string());
        let reply = if prompt.contains("Reply with exactly one label") {
            self.classify.clone()
        } else if prompt.contains("List every value the user must supply") {
            self.elicit.clone()
        } else if prompt.contains("You write PostgreSQL queries") {
            self.generate.clone()
        } else if prompt.contains("Does this result answer the question?") {
            self.validate.clone()
        } else if prompt.contains("List the business entities") {
            r#"["users"]"#.to_string()
        } else if prompt.contains("Answer the question in plain language") {
            "The users table stores one row per account.".to_string()
        } else if prompt.contains("explain what went wrong") {
            "Ask only for data you can read.".to_string()
        } else {
            return Err(LlmError::ResponseError("unexpected prompt".to_string()));
        };
        Ok(reply)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct FailingLlm;

#[async_trait]
impl LlmProvider for FailingLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::ConnectionError("connection refused".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// In-memory backend holding a fixed number of user rows.
struct FakeBackend {
    schema: Arc<DatabaseSchema>,
    total_rows: u64,
    executed: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn new(total_rows: u64) -> Self {
        let schema: DatabaseSchema = serde_json::from_value(json!({
            "tables": [{
                "name": "users",
                "columns": [
                    {"name": "id", "type": "int4", "nullable": false, "isPrimary": true},
                    {"name": "email", "type": "text", "nullable": false},
                    {"name": "created_at", "type": "timestamptz", "nullable": false}
                ]
            }]
        }))
        .unwrap();
        Self {
            schema: Arc::new(schema),
            total_rows,
            executed: Mutex::new(Vec::new()),
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

fn user_row(id: u64) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), json!(id));
    row.insert("email".to_string(), json!(format!("user{id}@example.com")));
    row
}

#[async_trait]
impl QueryBackend for FakeBackend {
    async fn schema(&self) -> Result<Arc<DatabaseSchema>, DbError> {
        Ok(Arc::clone(&self.schema))
    }

    async fn execute(&self, sql: &str, page: u32, page_size: u32) -> Result<QueryResult, DbError> {
        self.executed.lock().push(sql.to_string());
        let fields = vec![FieldInfo {
            name: "id".to_string(),
            data_type: "int4".to_string(),
            type_oid: 23,
        }];

        if is_aggregate_query(sql) {
            let mut row = Row::new();
            row.insert("count".to_string(), json!(self.total_rows));
            return Ok(QueryResult {
                rows: vec![row],
                fields,
                row_count: 1,
                pagination: None,
                execution_time_ms: 1,
            });
        }

        let start = u64::from(page - 1) * u64::from(page_size);
        let end = (start + u64::from(page_size)).min(self.total_rows);
        let rows: Vec<Row> = (start..end).map(user_row).collect();
        Ok(QueryResult {
            row_count: rows.len(),
            rows,
            fields,
            pagination: Some(PaginationState::new(page, page_size, self.total_rows)),
            execution_time_ms: 1,
        })
    }
}

fn request(query: &str) -> NlQuery {
    NlQuery {
        query: query.to_string(),
        inputs: None,
        context: None,
        page: 1,
        page_size: 200,
    }
}

const DATE_INPUT: &str = r#"```json
[{"name": "start_date", "description": "First day of last week", "type": "date", "example": "2024-05-06"}]
```"#;

#[tokio::test]
async fn relative_dates_ask_for_input_then_query_with_the_value() {
    let backend = FakeBackend::new(3);
    let (llm, prompts) = ScriptedLlm::new(
        "NEEDS_INPUT",
        "SELECT id, email FROM users WHERE created_at >= '2024-05-06'",
    )
    .with_elicit(DATE_INPUT)
    .into_client();

    let first = run_nl_query(&llm, &backend, None, &request("show me users created last week"))
        .await
        .unwrap();
    let QueryOutcome::InputRequired(inputs) = first else {
        panic!("expected an input request, got {first:?}");
    };
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].input_type, InputType::Date);
    assert!(backend.executed().is_empty());

    let mut values = BTreeMap::new();
    values.insert("start_date".to_string(), Value::String("2024-05-06".to_string()));
    let mut second_request = request("show me users created last week");
    second_request.inputs = Some(values);

    let second = run_nl_query(&llm, &backend, None, &second_request).await.unwrap();
    let QueryOutcome::Query { sql, result, validation, pagination } = second else {
        panic!("expected a query result, got {second:?}");
    };
    assert!(sql.contains("created_at >= '2024-05-06'"));
    assert_eq!(result.row_count, 3);
    assert!(validation.unwrap().is_valid);
    let pagination = pagination.unwrap();
    assert_eq!(pagination.total, 3);
    assert!(!pagination.has_more);

    // supplied inputs skip classification on the second pass
    let classify_prompts = prompts
        .lock()
        .iter()
        .filter(|p| p.contains("Reply with exactly one label"))
        .count();
    assert_eq!(classify_prompts, 1);
    assert!(prompts.lock().iter().any(|p| p.contains("start_date: 2024-05-06")));
}

#[tokio::test]
async fn generated_writes_are_rejected_before_execution() {
    let backend = FakeBackend::new(3);
    let (llm, _) = ScriptedLlm::new("NEEDS_QUERY", "```sql\nDELETE FROM users;\n```").into_client();

    let failure = run_nl_query(&llm, &backend, None, &request("remove everyone"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::ReadOnly(_)));
    assert!(failure.sql.is_some());
    assert!(failure.to_string().contains("Write operation not permitted"));
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn missing_input_sentinel_is_not_executed() {
    let backend = FakeBackend::new(3);
    let sentinel = format!("{MISSING_INPUT_SENTINEL}: the customer id");
    let (llm, _) = ScriptedLlm::new("NEEDS_QUERY", &sentinel).into_client();

    let failure = run_nl_query(&llm, &backend, None, &request("orders for my customer"))
        .await
        .unwrap_err();
    match failure.error {
        PipelineError::MissingInput(message) => assert_eq!(message, sentinel),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn fenced_missing_input_sentinel_is_not_executed() {
    let backend = FakeBackend::new(3);
    let reply = format!("```sql\n{MISSING_INPUT_SENTINEL}: the customer id\n```");
    let (llm, _) = ScriptedLlm::new("NEEDS_QUERY", &reply).into_client();

    let failure = run_nl_query(&llm, &backend, None, &request("orders for my customer"))
        .await
        .unwrap_err();
    match failure.error {
        PipelineError::MissingInput(message) => {
            assert_eq!(message, format!("{MISSING_INPUT_SENTINEL}: the customer id"))
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(failure.sql.is_none());
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn explanation_questions_skip_sql() {
    let backend = FakeBackend::new(3);
    let (llm, _) = ScriptedLlm::new("NEEDS_EXPLANATION", "SELECT 1").into_client();

    let outcome = run_nl_query(&llm, &backend, None, &request("what is stored in users?"))
        .await
        .unwrap();
    match outcome {
        QueryOutcome::Explanation(text) => assert!(text.contains("one row per account")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn empty_input_list_falls_through_to_generation() {
    let backend = FakeBackend::new(450);
    let (llm, _) = ScriptedLlm::new("NEEDS_INPUT", "SELECT id FROM users").into_client();

    let mut req = request("list users");
    req.page = 3;
    let outcome = run_nl_query(&llm, &backend, None, &req).await.unwrap();
    let QueryOutcome::Query { result, pagination, .. } = outcome else {
        panic!("expected a query result");
    };
    assert_eq!(result.row_count, 50);
    let pagination = pagination.unwrap();
    assert_eq!(pagination.total_pages, 3);
    assert!(!pagination.has_more);
}

#[tokio::test]
async fn aggregates_have_no_pagination() {
    let backend = FakeBackend::new(450);
    let (llm, _) = ScriptedLlm::new("NEEDS_QUERY", "SELECT COUNT(*) FROM users").into_client();

    let outcome = run_nl_query(&llm, &backend, None, &request("how many users")).await.unwrap();
    let QueryOutcome::Query { pagination, result, .. } = outcome else {
        panic!("expected a query result");
    };
    assert!(pagination.is_none());
    assert_eq!(result.rows[0]["count"], json!(450));
}

#[tokio::test]
async fn validation_failures_are_swallowed() {
    let backend = FakeBackend::new(2);
    let (llm, _) = ScriptedLlm::new("NEEDS_QUERY", "SELECT id FROM users")
        .with_validate("I think it looks fine")
        .into_client();

    let outcome = run_nl_query(&llm, &backend, None, &request("list users")).await.unwrap();
    let QueryOutcome::Query { validation, .. } = outcome else {
        panic!("expected a query result");
    };
    assert!(validation.is_none());
}

#[tokio::test]
async fn sessions_feed_prior_queries_into_prompts() {
    let sessions = SessionRegistry::new(Duration::from_secs(3600), 10);
    let backend = FakeBackend::new(5);
    let (llm, prompts) = ScriptedLlm::new("NEEDS_QUERY", "SELECT id, email FROM users WHERE email LIKE '%@example.com'")
        .into_client();

    run_nl_query(&llm, &backend, Some(sessions.handle("s1")), &request("list users with example emails"))
        .await
        .unwrap();
    assert_eq!(sessions.snapshot("s1").len(), 1);

    prompts.lock().clear();
    run_nl_query(&llm, &backend, Some(sessions.handle("s1")), &request("count users with example emails"))
        .await
        .unwrap();

    let prompts = prompts.lock();
    let generation = prompts
        .iter()
        .find(|p| p.contains("You write PostgreSQL queries"))
        .unwrap();
    assert!(generation.contains("Previous related question: list users with example emails"));
    assert!(generation.contains("Table users: filtered on email"));
    assert!(prompts.iter().any(|p| p.contains("List the business entities")));

    let history = sessions.snapshot("s1");
    assert_eq!(history.len(), 2);
    let latest = history.queries().next().unwrap();
    assert_eq!(latest.intent.as_deref(), Some("NEEDS_QUERY"));
    assert_eq!(latest.entities, vec!["users".to_string()]);

    // other sessions see nothing
    assert!(sessions.snapshot("s2").is_empty());
}

#[tokio::test]
async fn failed_attempts_are_recorded() {
    let sessions = SessionRegistry::new(Duration::from_secs(3600), 10);
    let backend = FakeBackend::new(1);
    let (llm, _) = ScriptedLlm::new("NEEDS_QUERY", "DROP TABLE users").into_client();

    let _ = run_nl_query(&llm, &backend, Some(sessions.handle("s1")), &request("reset")).await;
    let history = sessions.snapshot("s1");
    let attempt = history.queries().next().unwrap();
    assert!(!attempt.success);
    assert_eq!(attempt.generated_sql.as_deref(), Some("DROP TABLE users"));
}

#[tokio::test]
async fn client_context_reaches_the_prompts() {
    let backend = FakeBackend::new(1);
    let (llm, prompts) = ScriptedLlm::new("NEEDS_QUERY", "SELECT id FROM users").into_client();

    let mut req = request("and their emails?");
    req.context = Some("Previously asked: list user ids".to_string());
    run_nl_query(&llm, &backend, None, &req).await.unwrap();
    assert!(prompts
        .lock()
        .iter()
        .all(|p| !p.contains("Reply with exactly one label") || p.contains("Previously asked: list user ids")));
}

#[tokio::test]
async fn llm_failures_propagate_and_suggestions_degrade() {
    let backend = FakeBackend::new(1);
    let llm = LlmClient::with_provider(Box::new(FailingLlm));

    let failure = run_nl_query(&llm, &backend, None, &request("list users")).await.unwrap_err();
    assert!(matches!(failure.error, PipelineError::Llm(LlmError::ConnectionError(_))));

    let suggestion = suggest_fix(&llm, "list users", None, &failure.to_string()).await;
    assert_eq!(suggestion, NO_SUGGESTION);
}
