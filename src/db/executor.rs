use crate::db::guard;
use crate::db::multi_db_pool::PgPool;
use crate::db::DbError;
use postgres::types::Type;
use postgres::{Client, SimpleQueryMessage};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info};

static AGGREGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(count|sum|avg|min|max|group\s+by)\b").expect("valid aggregate regex")
});

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    pub data_type: String,
    pub type_oid: u32,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationState {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_more: bool,
}

impl PaginationState {
    pub fn new(page: u32, page_size: u32, total: u64) -> Self {
        let page_size = page_size.max(1);
        Self {
            page,
            page_size,
            total,
            total_pages: total.div_ceil(u64::from(page_size)),
            has_more: u64::from(page) * u64::from(page_size) < total,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub fields: Vec<FieldInfo>,
    pub row_count: usize,
    #[serde(skip)]
    pub pagination: Option<PaginationState>,
    #[serde(skip)]
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn sample(&self, limit: usize) -> Vec<Row> {
        self.rows.iter().take(limit).cloned().collect()
    }
}

/// Aggregates are returned whole; paging them would split a single answer.
pub fn is_aggregate_query(sql: &str) -> bool {
    AGGREGATE.is_match(sql)
}

pub fn count_sql(sql: &str) -> String {
    format!("WITH user_query AS ({sql}) SELECT COUNT(*) AS total FROM user_query")
}

pub fn page_sql(sql: &str, page: u32, page_size: u32) -> String {
    let offset = u64::from(page.max(1) - 1) * u64::from(page_size);
    format!("WITH user_query AS ({sql}) SELECT * FROM user_query LIMIT {page_size} OFFSET {offset}")
}

/// Runs a read-only statement and returns one page of its rows.
///
/// The statement is re-checked by the guard before a connection is checked
/// out; the pooled connection goes back to the pool when the task ends.
pub async fn execute_paginated(
    pool: PgPool,
    sql: &str,
    page: u32,
    page_size: u32,
) -> Result<QueryResult, DbError> {
    let sql = guard::ensure_read_only(sql)?;
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        run_paginated(&mut conn, &sql, page, page_size)
    })
    .await
    .map_err(|e| DbError::Task(e.to_string()))?
}

/// Runs a read-only statement without paging.
pub async fn execute_unpaged(pool: PgPool, sql: &str) -> Result<QueryResult, DbError> {
    let sql = guard::ensure_read_only(sql)?;
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        run_unpaged(&mut conn, &sql)
    })
    .await
    .map_err(|e| DbError::Task(e.to_string()))?
}

pub fn run_paginated(
    client: &mut Client,
    sql: &str,
    page: u32,
    page_size: u32,
) -> Result<QueryResult, DbError> {
    if is_aggregate_query(sql) {
        debug!("Aggregate query detected, skipping pagination");
        return run_unpaged(client, sql);
    }

    let start = Instant::now();
    let page = page.max(1);
    let page_size = page_size.max(1);

    let total: i64 = client.query_one(&count_sql(sql), &[])?.try_get("total")?;
    let (fields, rows) = fetch_rows(client, &page_sql(sql, page, page_size))?;
    let execution_time_ms = start.elapsed().as_millis() as u64;

    info!(
        "Query returned page {} ({} rows of {} total) in {}ms",
        page,
        rows.len(),
        total,
        execution_time_ms
    );

    Ok(QueryResult {
        row_count: rows.len(),
        rows,
        fields,
        pagination: Some(PaginationState::new(page, page_size, total.max(0) as u64)),
        execution_time_ms,
    })
}

pub fn run_unpaged(client: &mut Client, sql: &str) -> Result<QueryResult, DbError> {
    let start = Instant::now();
    let (fields, rows) = fetch_rows(client, sql)?;
    let execution_time_ms = start.elapsed().as_millis() as u64;
    info!("Query returned {} rows in {}ms", rows.len(), execution_time_ms);

    Ok(QueryResult {
        row_count: rows.len(),
        rows,
        fields,
        pagination: None,
        execution_time_ms,
    })
}

/// Prepares the statement for column metadata, then reads rows in text format
/// so every PostgreSQL type can be returned, typed by column OID.
fn fetch_rows(client: &mut Client, sql: &str) -> Result<(Vec<FieldInfo>, Vec<Row>), DbError> {
    let statement = client.prepare(sql)?;
    let columns: Vec<(String, Type)> = statement
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.type_().clone()))
        .collect();

    let fields = columns
        .iter()
        .map(|(name, ty)| FieldInfo {
            name: name.clone(),
            data_type: ty.name().to_string(),
            type_oid: ty.oid(),
        })
        .collect();

    let mut rows = Vec::new();
    for message in client.simple_query(sql)? {
        if let SimpleQueryMessage::Row(row) = message {
            let mut record = Map::with_capacity(columns.len());
            for (idx, (name, ty)) in columns.iter().enumerate() {
                let value = row.get(idx).map_or(Value::Null, |text| text_to_json(ty, text));
                record.insert(name.clone(), value);
            }
            rows.push(record);
        }
    }

    Ok((fields, rows))
}

/// Converts a text-format value into JSON using the column type.
///
/// `numeric` stays a string so no precision is lost.
pub fn text_to_json(ty: &Type, text: &str) -> Value {
    match *ty {
        Type::BOOL => match text {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        Type::FLOAT4 | Type::FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        Type::JSON | Type::JSONB => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}
