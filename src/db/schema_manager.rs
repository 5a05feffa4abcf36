use crate::db::schema::DatabaseSchema;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

struct CachedSchema {
    schema: Arc<DatabaseSchema>,
    fetched_at: Instant,
}

/// Time-bound cache of introspected schemas keyed by connection and credentials.
///
/// Concurrent refreshes for the same key are not coalesced; the last writer
/// wins and readers see at most `ttl`-old data.
pub struct SchemaCache {
    entries: RwLock<HashMap<String, CachedSchema>>,
    ttl: Duration,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached schema if it is younger than the TTL
    pub async fn get(&self, identity: &str) -> Option<Arc<DatabaseSchema>> {
        let entries = self.entries.read().await;
        let entry = entries.get(identity)?;
        if entry.fetched_at.elapsed() < self.ttl {
            debug!("Schema cache hit for {}", identity);
            Some(Arc::clone(&entry.schema))
        } else {
            debug!("Schema cache entry for {} expired", identity);
            None
        }
    }

    pub async fn insert(&self, identity: &str, schema: DatabaseSchema) -> Arc<DatabaseSchema> {
        let schema = Arc::new(schema);
        let mut entries = self.entries.write().await;
        entries.insert(
            identity.to_string(),
            CachedSchema {
                schema: Arc::clone(&schema),
                fetched_at: Instant::now(),
            },
        );
        schema
    }

    pub async fn invalidate(&self, identity: &str) {
        if self.entries.write().await.remove(identity).is_some() {
            info!("Invalidated cached schema for {}", identity);
        }
    }

    /// Drop every expired entry; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::Table;

    fn schema(name: &str) -> DatabaseSchema {
        DatabaseSchema {
            tables: vec![Table {
                name: name.to_string(),
                columns: vec![],
                foreign_keys: vec![],
                indexes: vec![],
                constraints: vec![],
                statistics: None,
            }],
        }
    }

    #[tokio::test]
    async fn returns_fresh_entries_and_invalidates() {
        let cache = SchemaCache::new(Duration::from_secs(300));
        assert!(cache.get("a").await.is_none());

        cache.insert("a", schema("users")).await;
        let cached = cache.get("a").await.unwrap();
        assert_eq!(cached.tables[0].name, "users");

        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        let cache = SchemaCache::new(Duration::from_millis(0));
        cache.insert("a", schema("users")).await;
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let cache = SchemaCache::new(Duration::from_secs(300));
        cache.insert("a", schema("old")).await;
        cache.insert("a", schema("new")).await;
        assert_eq!(cache.get("a").await.unwrap().tables[0].name, "new");
    }
}
