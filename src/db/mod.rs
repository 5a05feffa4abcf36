pub mod backend;
pub mod connection;
pub mod db_pool;
pub mod executor;
pub mod guard;
pub mod introspect;
pub mod multi_db_pool;
pub mod schema;
pub mod schema_manager;

pub use backend::{PgBackend, QueryBackend};
pub use guard::GuardError;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{}", postgres_message(.0))]
    Postgres(#[from] postgres::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error(transparent)]
    ReadOnly(#[from] GuardError),
    #[error("Unexpected catalog response: {0}")]
    Catalog(String),
    #[error("Database task failed: {0}")]
    Task(String),
}

/// SQLSTATE details kept from a failed statement for diagnostics.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DbError {
    /// Server-side error details, present only for errors raised by PostgreSQL itself.
    pub fn diagnostics(&self) -> Option<ErrorDiagnostics> {
        let DbError::Postgres(err) = self else {
            return None;
        };
        let db_error = err.as_db_error()?;
        let position = db_error.position().map(|pos| match pos {
            postgres::error::ErrorPosition::Original(p) => *p,
            postgres::error::ErrorPosition::Internal { position, .. } => *position,
        });

        Some(ErrorDiagnostics {
            code: Some(db_error.code().code().to_string()),
            position,
            detail: db_error.detail().map(str::to_string),
            hint: db_error.hint().map(str::to_string),
        })
    }

    pub fn is_read_only_violation(&self) -> bool {
        matches!(self, DbError::ReadOnly(_))
    }
}

fn postgres_message(err: &postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_error) => db_error.message().to_string(),
        None => err.to_string(),
    }
}
