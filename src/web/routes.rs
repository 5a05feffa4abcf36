use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Natural-language queries
        .route("/query", post(handlers::api::nl_query))
        .route("/query/session/{id}", delete(handlers::api::clear_session))

        // Connection and schema
        .route("/query/test-connection", post(handlers::api::test_connection))
        .route("/query/schema", post(handlers::api::get_schema))

        // Direct SQL
        .route("/query/execute", post(handlers::api::execute_query))
        .route("/execute-sql", post(handlers::api::execute_sql))

        // System status
        .route("/status", get(handlers::api::system_status))
}
