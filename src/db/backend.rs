use crate::db::connection::DatabaseConnectionConfig;
use crate::db::db_pool::PostgresConnectionManager;
use crate::db::executor::{self, QueryResult};
use crate::db::introspect;
use crate::db::multi_db_pool::{PgPool, PoolRegistry};
use crate::db::schema::DatabaseSchema;
use crate::db::schema_manager::SchemaCache;
use crate::db::DbError;
use async_trait::async_trait;
use r2d2::ManageConnection;
use std::sync::Arc;
use tracing::info;

/// What the natural-language pipeline needs from a database.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn schema(&self) -> Result<Arc<DatabaseSchema>, DbError>;

    async fn execute(&self, sql: &str, page: u32, page_size: u32) -> Result<QueryResult, DbError>;
}

/// PostgreSQL backend for one client connection config.
pub struct PgBackend {
    identity: String,
    cache_key: String,
    pool: PgPool,
    cache: Arc<SchemaCache>,
}

impl PgBackend {
    pub fn new(
        config: &DatabaseConnectionConfig,
        pools: &PoolRegistry,
        cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            identity: config.identity(),
            cache_key: config.pool_key(),
            pool: pools.pool_for(config),
            cache,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Schema cache key; carries the credential fingerprint so a cached
    /// schema is only served to callers holding the same password.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Drops the cached schema and introspects again.
    pub async fn refresh_schema(&self) -> Result<Arc<DatabaseSchema>, DbError> {
        self.cache.invalidate(&self.cache_key).await;
        self.schema().await
    }

    pub async fn execute_unpaged(&self, sql: &str) -> Result<QueryResult, DbError> {
        executor::execute_unpaged(self.pool.clone(), sql).await
    }

    async fn fetch_schema(&self) -> Result<DatabaseSchema, DbError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            introspect::introspect_schema(&mut conn)
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))?
    }
}

#[async_trait]
impl QueryBackend for PgBackend {
    async fn schema(&self) -> Result<Arc<DatabaseSchema>, DbError> {
        if let Some(schema) = self.cache.get(&self.cache_key).await {
            return Ok(schema);
        }
        info!("Fetching schema for {}", self.identity);
        let schema = self.fetch_schema().await?;
        Ok(self.cache.insert(&self.cache_key, schema).await)
    }

    async fn execute(&self, sql: &str, page: u32, page_size: u32) -> Result<QueryResult, DbError> {
        executor::execute_paginated(self.pool.clone(), sql, page, page_size).await
    }
}

/// Opens a dedicated connection outside the pool so the caller sees the real
/// driver error instead of a pool timeout.
pub async fn test_connection(
    config: &DatabaseConnectionConfig,
    settings: &crate::config::DatabaseSettings,
) -> Result<(), DbError> {
    let manager = PostgresConnectionManager::new(config.clone(), settings.clone());
    tokio::task::spawn_blocking(move || {
        let mut client = manager.connect()?;
        manager.is_valid(&mut client)?;
        info!("Connection test succeeded for {}", manager.identity());
        Ok(())
    })
    .await
    .map_err(|e| DbError::Task(e.to_string()))?
}
