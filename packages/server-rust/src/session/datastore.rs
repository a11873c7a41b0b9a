//! Synchronous durable session store over a key/value [`Datastore`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{SessionData, SessionError, SessionStore, SessionStoreKind};

/// Durable key/value backend holding encoded sessions.
#[async_trait]
pub trait Datastore: Send + Sync + fmt::Debug {
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Process-local [`Datastore`]. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryDatastore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
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

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Writes sessions to the datastore inline with the save.
#[derive(Debug, Clone)]
pub struct DatastoreSessionStore {
    datastore: Arc<dyn Datastore>,
}

impl DatastoreSessionStore {
    #[must_use]
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    fn backend_error(key: &str, source: anyhow::Error) -> SessionError {
        SessionError::Backend {
            store: SessionStoreKind::Datastore,
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl SessionStore for DatastoreSessionStore {
    fn kind(&self) -> SessionStoreKind {
        SessionStoreKind::Datastore
    }

    async fn save(&self, key: &str, data: &SessionData) -> Result<(), SessionError> {
        let bytes = data.encode(key)?;
        self.datastore
            .put(key, bytes)
            .await
            .map_err(|e| Self::backend_error(key, e))
    }

    async fn load(&self, key: &str) -> Result<Option<SessionData>, SessionError> {
        let bytes = self
            .datastore
            .get(key)
            .await
            .map_err(|e| Self::backend_error(key, e))?;
        bytes.map(|b| SessionData::decode(key, &b)).transpose()
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.datastore
            .delete(key)
            .await
            .map_err(|e| Self::backend_error(key, e))
    }
}
