//! The ordered session store chain.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use vmrt_core::Clock;

use super::cache::CacheSessionStore;
use super::datastore::{Datastore, DatastoreSessionStore};
use super::deferred::DeferredDatastoreSessionStore;
use super::{SessionData, SessionError, SessionStore, SessionStoreKind};
use crate::host::AppConfig;

/// `[durable, cache]`, written in that order.
///
/// A durable failure fails the operation. A cache failure is logged and
/// counted; the durable copy stays authoritative.
#[derive(Debug, Clone)]
pub struct SessionStoreChain {
    durable: Arc<dyn SessionStore>,
    cache: Arc<dyn SessionStore>,
    expiry: Option<SessionExpiry>,
}

/// Sliding session lifetime: every save pushes expiry `timeout` past now.
#[derive(Debug, Clone)]
struct SessionExpiry {
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl SessionExpiry {
    fn expires_at(&self) -> i64 {
        let timeout = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(timeout)
    }
}

impl SessionStoreChain {
    /// A chain whose sessions keep whatever expiry the caller sets.
    #[must_use]
    pub fn new(durable: Arc<dyn SessionStore>, cache: Arc<dyn SessionStore>) -> Self {
        Self {
            durable,
            cache,
            expiry: None,
        }
    }

    /// Stamps every saved session to expire `timeout` after the save, and
    /// treats sessions past their expiry as missing on load.
    #[must_use]
    pub fn with_session_timeout(mut self, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        self.expiry = Some(SessionExpiry { clock, timeout });
        self
    }

    #[must_use]
    pub fn session_timeout(&self) -> Option<Duration> {
        self.expiry.as_ref().map(|expiry| expiry.timeout)
    }

    /// Stores in write order.
    #[must_use]
    pub fn stores(&self) -> [&Arc<dyn SessionStore>; 2] {
        [&self.durable, &self.cache]
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<SessionStoreKind> {
        self.stores().iter().map(|store| store.kind()).collect()
    }

    #[must_use]
    pub fn durable(&self) -> &Arc<dyn SessionStore> {
        &self.durable
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn SessionStore> {
        &self.cache
    }

    /// # Errors
    ///
    /// Fails only if the durable store fails.
    pub async fn save(&self, key: &str, data: &SessionData) -> Result<(), SessionError> {
        let data = match &self.expiry {
            Some(expiry) => Cow::Owned(SessionData {
                expires_at_millis: expiry.expires_at(),
                ..data.clone()
            }),
            None => Cow::Borrowed(data),
        };
        self.durable.save(key, &data).await?;
        if let Err(err) = self.cache.save(key, &data).await {
            cache_failure("save", key, &err);
        }
        Ok(())
    }

    /// Loads from the durable store, which is authoritative. An expired
    /// session counts as missing.
    ///
    /// A durable miss also evicts the key from the cache: a cache entry must
    /// never outlive its durable counterpart, even when an earlier cache
    /// delete failed.
    ///
    /// # Errors
    ///
    /// Fails only if the durable store fails.
    pub async fn load(&self, key: &str) -> Result<Option<SessionData>, SessionError> {
        let data = self.durable.load(key).await?.filter(|data| match &self.expiry {
            Some(expiry) => !data.is_expired(expiry.clock.now_millis()),
            None => true,
        });
        if data.is_none() {
            if let Err(err) = self.cache.delete(key).await {
                cache_failure("evict", key, &err);
            }
        }
        Ok(data)
    }

    /// # Errors
    ///
    /// Fails only if the durable store fails.
    pub async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.durable.delete(key).await?;
        if let Err(err) = self.cache.delete(key).await {
            cache_failure("delete", key, &err);
        }
        Ok(())
    }

    /// Waits up to `timeout` for queued durable writes to land.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.durable.flush(timeout).await
    }
}

fn cache_failure(operation: &'static str, key: &str, err: &SessionError) {
    metrics::counter!("vmrt_session_cache_failures_total", "operation" => operation).increment(1);
    warn!(operation, key, error = %err, "session cache operation failed");
}

/// Assembles the chain from application configuration.
///
/// With async session persistence the durable store is the deferred variant
/// bound to the configured queue.
///
/// # Errors
///
/// Returns [`SessionError::NoRuntime`] if the deferred store cannot start its
/// queue outside a tokio runtime.
pub fn create_session_stores(
    config: &AppConfig,
    datastore: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
) -> Result<SessionStoreChain, SessionError> {
    let durable: Arc<dyn SessionStore> = if config.async_session_persistence {
        Arc::new(DeferredDatastoreSessionStore::new(
            config.async_session_persistence_queue_name.clone(),
            datastore,
        )?)
    } else {
        Arc::new(DatastoreSessionStore::new(datastore))
    };
    let cache = Arc::new(CacheSessionStore::new(
        config.session_cache_capacity,
        Arc::clone(&clock),
    ));
    let chain = SessionStoreChain::new(durable, cache);
    Ok(match config.session_timeout_secs {
        0 => chain,
        secs => chain.with_session_timeout(clock, Duration::from_secs(secs)),
    })
}
