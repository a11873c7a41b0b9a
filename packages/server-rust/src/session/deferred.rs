//! Durable session store that writes through a named queue.
//!
//! A save returns once the write is queued. A background task drains the
//! queue into the [`Datastore`] in submission order. Until a queued write
//! lands, loads of that key are answered from the queued value so callers
//! read their own writes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vmrt_core::{InFlightCounter, InFlightGuard};

use super::datastore::Datastore;
use super::{SessionData, SessionError, SessionStore, SessionStoreKind};

const QUEUE_CAPACITY: usize = 256;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Latest queued value per key, tagged with its sequence number.
type Overlay = DashMap<String, (u64, Option<Vec<u8>>)>;

enum WriteOp {
    Put(Vec<u8>),
    Delete,
}

struct QueuedWrite {
    key: String,
    seq: u64,
    op: WriteOp,
    _pending: InFlightGuard,
}

#[derive(Debug)]
pub struct DeferredDatastoreSessionStore {
    queue: String,
    tx: mpsc::Sender<QueuedWrite>,
    datastore: Arc<dyn Datastore>,
    overlay: Arc<Overlay>,
    next_seq: Mutex<u64>,
    pending: InFlightCounter,
}

impl DeferredDatastoreSessionStore {
    /// Creates the store and spawns the task draining `queue`.
    ///
    /// The task stops once the store is dropped and the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoRuntime`] outside a tokio runtime.
    pub fn new(queue: impl Into<String>, datastore: Arc<dyn Datastore>) -> Result<Self, SessionError> {
        let queue = queue.into();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime {
            queue: queue.clone(),
        })?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let overlay = Arc::new(Overlay::new());
        runtime.spawn(drain(
            queue.clone(),
            rx,
            Arc::clone(&datastore),
            Arc::clone(&overlay),
        ));

        Ok(Self {
            queue,
            tx,
            datastore,
            overlay,
            next_seq: Mutex::new(0),
            pending: InFlightCounter::new(),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Writes queued but not yet applied.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        self.pending.count()
    }

    async fn enqueue(&self, key: &str, op: WriteOp) -> Result<(), SessionError> {
        let permit = self.tx.reserve().await.map_err(|_| SessionError::QueueClosed {
            queue: self.queue.clone(),
        })?;
        let staged = match &op {
            WriteOp::Put(bytes) => Some(bytes.clone()),
            WriteOp::Delete => None,
        };

        // Sequence order, overlay order and queue order must agree.
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;
        self.overlay.insert(key.to_string(), (seq, staged));
        permit.send(QueuedWrite {
            key: key.to_string(),
            seq,
            op,
            _pending: self.pending.guard(),
        });
        Ok(())
    }
}

#[async_trait]
impl SessionStore for DeferredDatastoreSessionStore {
    fn kind(&self) -> SessionStoreKind {
        SessionStoreKind::DeferredDatastore {
            queue: self.queue.clone(),
        }
    }

    async fn save(&self, key: &str, data: &SessionData) -> Result<(), SessionError> {
        let bytes = data.encode(key)?;
        self.enqueue(key, WriteOp::Put(bytes)).await
    }

    async fn load(&self, key: &str) -> Result<Option<SessionData>, SessionError> {
        let staged = self.overlay.get(key).map(|entry| entry.value().1.clone());
        let bytes = match staged {
            Some(staged) => staged,
            None => self
                .datastore
                .get(key)
                .await
                .map_err(|source| SessionError::Backend {
                    store: self.kind(),
                    key: key.to_string(),
                    source,
                })?,
        };
        bytes.map(|b| SessionData::decode(key, &b)).transpose()
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.enqueue(key, WriteOp::Delete).await
    }

    async fn flush(&self, timeout: Duration) -> bool {
        self.pending.wait_for_zero(timeout).await
    }
}

async fn drain(
    queue: String,
    mut rx: mpsc::Receiver<QueuedWrite>,
    datastore: Arc<dyn Datastore>,
    overlay: Arc<Overlay>,
) {
    while let Some(write) = rx.recv().await {
        apply(&queue, datastore.as_ref(), &write).await;
        overlay.remove_if(&write.key, |_, (queued, _)| *queued == write.seq);
    }
    debug!(queue = %queue, "session write queue closed");
}

async fn apply(queue: &str, datastore: &dyn Datastore, write: &QueuedWrite) {
    for attempt in 1..=MAX_ATTEMPTS {
        let result = match &write.op {
            WriteOp::Put(bytes) => datastore.put(&write.key, bytes.clone()).await,
            WriteOp::Delete => datastore.delete(&write.key).await,
        };
        match result {
            Ok(()) => return,
            Err(err) if attempt < MAX_ATTEMPTS => {
                debug!(queue, key = %write.key, attempt, error = %err, "retrying session write");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(err) => {
                metrics::counter!("vmrt_session_deferred_write_failures_total").increment(1);
                warn!(
                    queue,
                    key = %write.key,
                    attempts = MAX_ATTEMPTS,
                    error = %err,
                    "dropping session write after repeated failures"
                );
            }
        }
    }
}
