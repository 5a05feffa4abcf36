use crate::config::DatabaseSettings;
use crate::db::connection::DatabaseConnectionConfig;
use crate::db::db_pool::PostgresConnectionManager;
use parking_lot::Mutex;
use r2d2::Pool;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

pub type PgPool = Pool<PostgresConnectionManager>;

struct RegisteredPool {
    pool: PgPool,
    last_used: Instant,
}

/// Keeps one connection pool per distinct client connection config.
///
/// Pools are created lazily without touching the network; connections are
/// only opened when a query checks one out. The registry is bounded and drops
/// the least recently used pool when full.
pub struct PoolRegistry {
    settings: DatabaseSettings,
    pools: Mutex<HashMap<String, RegisteredPool>>,
}

impl PoolRegistry {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    /// Get the pool for a connection config, registering it on first use
    pub fn pool_for(&self, config: &DatabaseConnectionConfig) -> PgPool {
        let key = config.pool_key();
        let mut pools = self.pools.lock();

        if let Some(entry) = pools.get_mut(&key) {
            entry.last_used = Instant::now();
            return entry.pool.clone();
        }

        if pools.len() >= self.settings.max_pools.max(1) {
            let oldest = pools
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                debug!("Evicting idle connection pool {}", oldest);
                pools.remove(&oldest);
            }
        }

        let manager = PostgresConnectionManager::new(config.clone(), self.settings.clone());
        let pool = Pool::builder()
            .max_size(self.settings.pool_max_size)
            .min_idle(Some(0))
            .idle_timeout(Some(self.settings.idle_timeout()))
            .connection_timeout(self.settings.connect_timeout())
            .build_unchecked(manager);

        info!("Registered connection pool for {}", config.identity());
        pools.insert(
            key,
            RegisteredPool {
                pool: pool.clone(),
                last_used: Instant::now(),
            },
        );
        pool
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
