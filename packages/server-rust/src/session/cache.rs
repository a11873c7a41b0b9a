//! Fast in-process session cache.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use quick_cache::sync::Cache;
use vmrt_core::Clock;

use super::{SessionData, SessionError, SessionStore, SessionStoreKind};

/// Bounded cache of encoded sessions. Expired entries are dropped on read.
pub struct CacheSessionStore {
    entries: Cache<String, Vec<u8>>,
    clock: Arc<dyn Clock>,
}

impl CacheSessionStore {
    #[must_use]
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Cache::new(capacity),
            clock,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CacheSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSessionStore")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionStore for CacheSessionStore {
    fn kind(&self) -> SessionStoreKind {
        SessionStoreKind::Cache
    }

    async fn save(&self, key: &str, data: &SessionData) -> Result<(), SessionError> {
        if data.is_expired(self.clock.now_millis()) {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(key.to_string(), data.encode(key)?);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<SessionData>, SessionError> {
        let Some(bytes) = self.entries.get(key) else {
            return Ok(None);
        };
        let data = SessionData::decode(key, &bytes)?;
        if data.is_expired(self.clock.now_millis()) {
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(data))
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.entries.remove(key);
        Ok(())
    }
}
