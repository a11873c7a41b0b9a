//! Session persistence.
//!
//! Session state is written through a [`SessionStoreChain`]: a durable store
//! first, a fast cache second, so a cached entry never outlives its durable
//! counterpart. The durable store is either written inline
//! ([`DatastoreSessionStore`]) or through a named write queue
//! ([`DeferredDatastoreSessionStore`]).

pub mod cache;
pub mod chain;
pub mod datastore;
pub mod deferred;
#[cfg(feature = "redb")]
pub mod redb_store;

pub use cache::CacheSessionStore;
pub use chain::{create_session_stores, SessionStoreChain};
pub use datastore::{Datastore, DatastoreSessionStore, MemoryDatastore};
pub use deferred::DeferredDatastoreSessionStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbDatastore;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to encode session {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("failed to decode session {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("{store} store failed for session {key}: {source}")]
    Backend {
        store: SessionStoreKind,
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("write queue {queue} is closed")]
    QueueClosed { queue: String },
    #[error("no async runtime available to drain write queue {queue}")]
    NoRuntime { queue: String },
}

/// Which backend a store in the chain is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionStoreKind {
    Datastore,
    DeferredDatastore { queue: String },
    Cache,
}

impl SessionStoreKind {
    #[must_use]
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Cache)
    }
}

impl fmt::Display for SessionStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datastore => f.write_str("datastore"),
            Self::DeferredDatastore { queue } => write!(f, "deferred-datastore({queue})"),
            Self::Cache => f.write_str("cache"),
        }
    }
}

/// One session's attributes plus its expiry.
///
/// Attribute values are opaque bytes; the session subsystem owns their
/// format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub attributes: BTreeMap<String, Vec<u8>>,
    /// Epoch millis after which the session is gone. `0` never expires.
    pub expires_at_millis: i64,
}

impl SessionData {
    #[must_use]
    pub fn new(expires_at_millis: i64) -> Self {
        Self {
            attributes: BTreeMap::new(),
            expires_at_millis,
        }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at_millis > 0 && now_millis >= self.expires_at_millis
    }

    /// MessagePack encoding stored by every backend.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Encode`] if serialization fails.
    pub fn encode(&self, key: &str) -> Result<Vec<u8>, SessionError> {
        rmp_serde::to_vec_named(self).map_err(|source| SessionError::Encode {
            key: key.to_string(),
            source,
        })
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Decode`] if `bytes` is not an encoded session.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, SessionError> {
        rmp_serde::from_slice(bytes).map_err(|source| SessionError::Decode {
            key: key.to_string(),
            source,
        })
    }
}

/// A backend session state is persisted to.
#[async_trait]
pub trait SessionStore: Send + Sync + fmt::Debug {
    fn kind(&self) -> SessionStoreKind;

    async fn save(&self, key: &str, data: &SessionData) -> Result<(), SessionError>;

    async fn load(&self, key: &str) -> Result<Option<SessionData>, SessionError>;

    async fn delete(&self, key: &str) -> Result<(), SessionError>;

    /// Waits up to `timeout` for writes accepted earlier to reach the
    /// backend. Returns `false` if some were still pending at the bound.
    async fn flush(&self, _timeout: Duration) -> bool {
        true
    }
}
