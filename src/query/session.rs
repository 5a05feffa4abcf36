use crate::query::context::{ConversationContext, QueryContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct Session {
    context: ConversationContext,
    last_seen: Instant,
}

/// One conversation context per client session id, dropped after sitting idle.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
    max_queries: usize,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration, max_queries: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            max_queries,
        }
    }

    pub fn handle<'a>(&'a self, id: &'a str) -> SessionHandle<'a> {
        SessionHandle { registry: self, id }
    }

    /// Copy of the session's history, creating the session on first use.
    pub fn snapshot(&self, id: &str) -> ConversationContext {
        let mut sessions = self.sessions.lock();
        let session = self.touch(&mut sessions, id);
        session.context.clone()
    }

    pub fn record(&self, id: &str, query: QueryContext) {
        let mut sessions = self.sessions.lock();
        let session = self.touch(&mut sessions, id);
        session.context.add_query(query);
        debug!("Session {} now holds {} queries", id, session.context.len());
    }

    fn touch<'m>(&self, sessions: &'m mut HashMap<String, Session>, id: &str) -> &'m mut Session {
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            info!("Starting session {}", id);
            Session {
                context: ConversationContext::new(self.max_queries),
                last_seen: Instant::now(),
            }
        });
        session.last_seen = Instant::now();
        session
    }

    /// Ends a session; returns whether it existed.
    pub fn clear(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            info!("Cleared session {}", id);
        }
        removed
    }

    pub fn purge_idle(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        let idle_timeout = self.idle_timeout;
        sessions.retain(|_, s| s.last_seen.elapsed() < idle_timeout);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// A borrowed view of one session used by the pipeline.
#[derive(Clone, Copy)]
pub struct SessionHandle<'a> {
    registry: &'a SessionRegistry,
    id: &'a str,
}

impl SessionHandle<'_> {
    pub fn id(&self) -> &str {
        self.id
    }

    pub fn snapshot(&self) -> ConversationContext {
        self.registry.snapshot(self.id)
    }

    pub fn record(&self, query: QueryContext) {
        self.registry.record(self.id, query)
    }
}
