use crate::logic::TableField;
use crate::model::{generate_id, SessionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// A table field shared between requests; one request at a time may edit it.
pub type SharedField = Arc<Mutex<TableField>>;

/// An open field session as handed out by the cache
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub field: SharedField,
    pub created_at: DateTime<Utc>,
    /// true if the working list was edited since the last load or save
    pub dirty: bool,
}

#[derive(Debug)]
struct SessionEntry {
    field: SharedField,
    created_at: DateTime<Utc>,
    last_accessed: Instant,
    dirty: bool,
}

/// Open field sessions keyed by session id, dropped after `ttl` without access.
/// Clones share the same sessions.
#[derive(Debug, Clone)]
pub struct SessionCache {
    entries: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a hydrated field and returns its new session id
    pub async fn open(&self, field: TableField) -> Session {
        let id = generate_id();
        let entry = SessionEntry {
            field: Arc::new(Mutex::new(field)),
            created_at: Utc::now(),
            last_accessed: Instant::now(),
            dirty: false,
        };
        let session = Session {
            id: id.clone(),
            field: Arc::clone(&entry.field),
            created_at: entry.created_at,
            dirty: false,
        };

        self.entries.write().await.insert(id, entry);
        session
    }

    /// Get a session if present and not expired
    pub async fn get(&self, id: &str) -> Option<Session> {
        let mut entries = self.entries.write().await;

        let entry = entries.get_mut(id)?;
        if entry.last_accessed.elapsed() > self.ttl {
            entries.remove(id);
            return None;
        }

        entry.last_accessed = Instant::now();
        Some(Session {
            id: id.to_string(),
            field: Arc::clone(&entry.field),
            created_at: entry.created_at,
            dirty: entry.dirty,
        })
    }

    pub async fn mark_dirty(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.dirty = true;
            entry.last_accessed = Instant::now();
        }
    }

    /// Mark a session as matching the store again
    pub async fn mark_clean(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.dirty = false;
        }
    }

    /// Ids of sessions holding unsaved edits
    pub async fn dirty_sessions(&self) -> Vec<SessionId> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns false if no such session was open
    pub async fn remove(&self, id: &str) -> bool {
        self.entries.write().await.remove(id).is_some()
    }

    /// Drops every expired session; returns how many were dropped
    pub async fn clear_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_accessed.elapsed() <= ttl);
        let dropped = before - entries.len();
        if dropped > 0 {
            log::debug!("Dropped {} expired field sessions", dropped);
        }
        dropped
    }

    /// Runs `clear_expired` every `every` until the returned task is aborted
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                cache.clear_expired().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
