//! Binding a request environment to whichever thread runs the request.
//!
//! Tokio may move a task between worker threads at every await point, so a
//! future is only "inside" its request while it is being polled. [`Scoped`]
//! activates the environment for the duration of each poll and restores the
//! previous one afterwards. The request-level enter/exit pair is counted once
//! per scope, not once per poll.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use vmrt_core::ActivationGuard;

use super::{ContextError, RequestContext};

/// Synchronous enter/exit bracket returned by [`RequestContext::enter`].
///
/// Dropping the guard exits: the environment is deactivated for the calling
/// thread and the exit is counted. Not `Send`, since the activation belongs
/// to the thread that entered.
#[must_use = "the request is exited as soon as the guard is dropped"]
pub struct ContextGuard {
    ctx: Arc<RequestContext>,
    activation: Option<ActivationGuard>,
}

impl ContextGuard {
    pub(super) fn new(ctx: Arc<RequestContext>, activation: ActivationGuard) -> Self {
        Self {
            ctx,
            activation: Some(activation),
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("request_id", &self.ctx.request_id())
            .finish_non_exhaustive()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        drop(self.activation.take());
        self.ctx.record_exit();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotEntered,
    Entered,
    Finished,
}

/// Future that runs `F` with its request's environment active.
///
/// The first poll performs the enter and fails with
/// [`ContextError::IllegalState`] if the request has already completed.
/// The matching exit is recorded when `F` finishes or when the `Scoped` is
/// dropped early, whichever comes first.
pub struct Scoped<F> {
    ctx: Arc<RequestContext>,
    inner: Pin<Box<F>>,
    phase: Phase,
    lifecycle: bool,
}

impl<F> Scoped<F> {
    /// With `lifecycle` set, the first poll is the request's dispatch enter
    /// and moves a freshly created context to entered.
    pub(super) fn new(ctx: Arc<RequestContext>, inner: F, lifecycle: bool) -> Self {
        Self {
            ctx,
            inner: Box::pin(inner),
            phase: Phase::NotEntered,
            lifecycle,
        }
    }
}

impl<F> fmt::Debug for Scoped<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped")
            .field("request_id", &self.ctx.request_id())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = Result<F::Output, ContextError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.phase {
            Phase::NotEntered => {
                if let Err(err) = this.ctx.begin_enter(this.lifecycle) {
                    this.phase = Phase::Finished;
                    return Poll::Ready(Err(err));
                }
                this.phase = Phase::Entered;
            }
            Phase::Entered => {}
            Phase::Finished => panic!("`Scoped` polled after completion"),
        }

        let poll = {
            let _active = this.ctx.activate();
            this.inner.as_mut().poll(cx)
        };

        if poll.is_ready() {
            this.phase = Phase::Finished;
            this.ctx.record_exit();
        }
        poll.map(Ok)
    }
}

impl<F> Drop for Scoped<F> {
    fn drop(&mut self) {
        if self.phase == Phase::Entered {
            self.ctx.record_exit();
        }
    }
}
