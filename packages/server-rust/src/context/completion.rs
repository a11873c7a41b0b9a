//! Single-resolution completion signal for asynchronous request processing.
//!
//! A handler that keeps working after its dispatch returns calls
//! [`RequestContext::start_async`](super::RequestContext::start_async) and
//! holds the returned [`AsyncCompletion`]. The signal resolves exactly once:
//! when the handle is completed, when it is dropped without completing, or
//! when the async deadline passes. Timeouts and errors the handler reports
//! along the way are recorded as metadata and never resolve the signal.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// How an async cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Dispatch returned without starting async processing.
    Synchronous,
    /// The handler signalled true completion.
    Completed,
    /// The handler dropped its completion handle, or the dispatch was
    /// dropped before it returned.
    Abandoned,
    /// Nothing completed the cycle before the async deadline.
    DeadlineExceeded,
}

impl CompletionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub kind: CompletionKind,
    /// The handler reported a timeout before the cycle ended.
    pub timed_out: bool,
    /// Errors the handler reported before the cycle ended.
    pub errors: Vec<String>,
}

impl CompletionOutcome {
    #[must_use]
    pub fn new(kind: CompletionKind) -> Self {
        Self {
            kind,
            timed_out: false,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn synchronous() -> Self {
        Self::new(CompletionKind::Synchronous)
    }

    #[must_use]
    pub fn abandoned() -> Self {
        Self::new(CompletionKind::Abandoned)
    }
}

#[derive(Debug, Default)]
struct Events {
    timed_out: bool,
    errors: Vec<String>,
}

/// Per-request async state: started or not, plus the pending signal.
#[derive(Debug, Default)]
pub(crate) struct AsyncCycle {
    events: Arc<Mutex<Events>>,
    signal: Mutex<Option<oneshot::Receiver<()>>>,
    started: Mutex<bool>,
}

impl AsyncCycle {
    /// Starts the cycle. Returns `None` if it was already started.
    pub(crate) fn start(&self) -> Option<AsyncCompletion> {
        let mut started = self.started.lock();
        if *started {
            return None;
        }
        *started = true;

        let (tx, rx) = oneshot::channel();
        *self.signal.lock() = Some(rx);
        Some(AsyncCompletion {
            events: Arc::clone(&self.events),
            tx,
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        *self.started.lock()
    }

    /// Takes the pending signal. Only the first caller gets it, which is
    /// what keeps completion-listener registration one-shot.
    pub(crate) fn take_signal(&self) -> Option<CompletionSignal> {
        self.signal.lock().take().map(|rx| CompletionSignal {
            rx,
            events: Arc::clone(&self.events),
        })
    }
}

/// Handle held by the code finishing an async request.
#[derive(Debug)]
pub struct AsyncCompletion {
    events: Arc<Mutex<Events>>,
    tx: oneshot::Sender<()>,
}

impl AsyncCompletion {
    /// Records that the handler hit its own timeout. Does not complete the cycle.
    pub fn record_timeout(&self) {
        self.events.lock().timed_out = true;
    }

    /// Records a handler error. Does not complete the cycle.
    pub fn record_error(&self, message: impl Into<String>) {
        self.events.lock().errors.push(message.into());
    }

    /// Signals true completion.
    pub fn complete(self) {
        // The listener may already have given up at its deadline.
        let _ = self.tx.send(());
    }
}

/// Listener side of an [`AsyncCycle`].
#[derive(Debug)]
pub(crate) struct CompletionSignal {
    rx: oneshot::Receiver<()>,
    events: Arc<Mutex<Events>>,
}

impl CompletionSignal {
    /// Resolves when the cycle ends, or when `deadline` elapses.
    pub(crate) async fn wait(self, deadline: Duration) -> CompletionOutcome {
        let kind = match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(())) => CompletionKind::Completed,
            Ok(Err(_)) => CompletionKind::Abandoned,
            Err(_) => CompletionKind::DeadlineExceeded,
        };

        let events = self.events.lock();
        CompletionOutcome {
            kind,
            timed_out: events.timed_out,
            errors: events.errors.clone(),
        }
    }
}
