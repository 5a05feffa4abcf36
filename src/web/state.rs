use crate::config::AppConfig;
use crate::db::connection::DatabaseConnectionConfig;
use crate::db::multi_db_pool::PoolRegistry;
use crate::db::schema_manager::SchemaCache;
use crate::db::PgBackend;
use crate::query::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pools: PoolRegistry,
    pub schema_cache: Arc<SchemaCache>,
    pub sessions: SessionRegistry,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let pools = PoolRegistry::new(config.database.clone());
        let schema_cache = Arc::new(SchemaCache::new(Duration::from_secs(
            config.cache.schema_ttl_secs,
        )));
        let sessions = SessionRegistry::new(
            Duration::from_secs(config.session.idle_timeout_secs),
            config.query.max_context_queries,
        );

        Self {
            config,
            pools,
            schema_cache,
            sessions,
            startup_time: chrono::Utc::now(),
        }
    }

    pub fn backend(&self, db_config: &DatabaseConnectionConfig) -> PgBackend {
        PgBackend::new(db_config, &self.pools, Arc::clone(&self.schema_cache))
    }

    /// Drops expired schemas and idle sessions.
    pub async fn purge_expired(&self) -> (usize, usize) {
        let schemas = self.schema_cache.purge_expired().await;
        let sessions = self.sessions.purge_idle();
        (schemas, sessions)
    }
}
