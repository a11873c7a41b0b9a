//! Per-request execution context.
//!
//! A [`RequestContext`] owns one request's environment and drives it through
//! the dispatch lifecycle:
//!
//! ```text
//! Created -> Entered -> DispatchExited -> Completing -> Done
//!                    \-> AwaitingAsyncCompletion -/
//! ```
//!
//! - **enter**: the environment is activated on the calling thread.
//! - **exit dispatch**: the container's dispatch returned. Without async
//!   processing the completion routine runs right away; otherwise a one-shot
//!   listener waits for the async cycle to end.
//! - **completion**: attributed workers are interrupted and outstanding API
//!   calls are given time to drain, each under its own hard bound.

pub mod completion;
pub mod dispatch;
pub mod layer;
pub mod scope;

pub use completion::{AsyncCompletion, CompletionKind, CompletionOutcome};
pub use dispatch::DispatchKind;
pub use layer::{RequestContextLayer, RequestContextService};
pub use scope::{ContextGuard, Scoped};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use vmrt_core::{ActivationGuard, Environment, EnvironmentRegistry};

use completion::AsyncCycle;

/// Bounds applied by the completion routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionLimits {
    /// How long to wait for interrupted workers to stop.
    pub interrupt_wait: Duration,
    /// How long to wait for in-flight API calls to finish.
    pub api_call_wait: Duration,
    /// How long an async cycle may stay open before cleanup runs anyway.
    pub async_deadline: Duration,
}

impl Default for CompletionLimits {
    fn default() -> Self {
        Self {
            interrupt_wait: Duration::from_secs(2),
            api_call_wait: Duration::from_secs(2),
            async_deadline: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Entered,
    DispatchExited,
    AwaitingAsyncCompletion,
    Completing,
    Done,
}

impl ContextState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Entered => "entered",
            Self::DispatchExited => "dispatch_exited",
            Self::AwaitingAsyncCompletion => "awaiting_async_completion",
            Self::Completing => "completing",
            Self::Done => "done",
        }
    }

    fn accepts_entry(self) -> bool {
        !matches!(self, Self::Completing | Self::Done)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("cannot {operation} request {request_id} in state {state}")]
    IllegalState {
        request_id: String,
        operation: &'static str,
        state: ContextState,
    },
    #[error("asynchronous processing already started for request {request_id}")]
    AsyncAlreadyStarted { request_id: String },
    #[error("no async runtime available to finish request {request_id}")]
    NoRuntime { request_id: String },
    #[error("completion routine for request {request_id} did not finish: {reason}")]
    CompletionAborted { request_id: String, reason: String },
}

impl IntoResponse for ContextError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// What the completion routine observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub outcome: CompletionOutcome,
    /// All interrupted workers stopped within the interrupt bound.
    pub workers_stopped: bool,
    /// All API calls finished within the drain bound.
    pub api_calls_drained: bool,
    pub elapsed: Duration,
}

/// Result of [`RequestContext::exit_dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchExit {
    /// The request finished synchronously and has been cleaned up.
    Completed(CompletionReport),
    /// Async processing is running; cleanup happens when it ends.
    AwaitingCompletion,
}

pub struct RequestContext {
    request_id: String,
    environment: Arc<Environment>,
    registry: Arc<dyn EnvironmentRegistry>,
    limits: CompletionLimits,
    state: Mutex<ContextState>,
    async_cycle: AsyncCycle,
    enters: AtomicU64,
    exits: AtomicU64,
    completions: AtomicU64,
    report: Mutex<Option<CompletionReport>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("state", &self.state())
            .field("enters", &self.enter_count())
            .field("exits", &self.exit_count())
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        environment: Arc<Environment>,
        registry: Arc<dyn EnvironmentRegistry>,
        limits: CompletionLimits,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            environment,
            registry,
            limits,
            state: Mutex::new(ContextState::Created),
            async_cycle: AsyncCycle::default(),
            enters: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            report: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    #[must_use]
    pub fn limits(&self) -> CompletionLimits {
        self.limits
    }

    #[must_use]
    pub fn enter_count(&self) -> u64 {
        self.enters.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn exit_count(&self) -> u64 {
        self.exits.load(Ordering::SeqCst)
    }

    /// Number of times the completion routine has run (0 or 1).
    #[must_use]
    pub fn completion_count(&self) -> u64 {
        self.completions.load(Ordering::SeqCst)
    }

    /// What the completion routine observed, once it has run.
    #[must_use]
    pub fn completion_report(&self) -> Option<CompletionReport> {
        self.report.lock().clone()
    }

    #[must_use]
    pub fn is_async_started(&self) -> bool {
        self.async_cycle.is_started()
    }

    /// Enters the request on the calling thread: a created context moves to
    /// entered and the request environment stays active until the returned
    /// guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] once completion has begun.
    pub fn enter(self: &Arc<Self>) -> Result<ContextGuard, ContextError> {
        self.begin_enter(true)?;
        Ok(ContextGuard::new(Arc::clone(self), self.activate()))
    }

    /// Runs `f` inside a plain enter/exit bracket that leaves the dispatch
    /// lifecycle alone. Used for ad-hoc work the host runs on a request's
    /// behalf.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] once completion has begun.
    pub fn in_scope<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> Result<R, ContextError> {
        self.begin_enter(false)?;
        let _guard = ContextGuard::new(Arc::clone(self), self.activate());
        Ok(f())
    }

    /// Async counterpart of [`RequestContext::in_scope`]: every poll of `fut`
    /// runs with the request environment active.
    pub fn scope<F: Future>(self: &Arc<Self>, fut: F) -> Scoped<F> {
        Scoped::new(Arc::clone(self), fut, false)
    }

    /// Runs one full dispatch: enter, `fut`, exit dispatch.
    ///
    /// The exit runs even if `fut` panics; the panic is resumed afterwards.
    /// If the returned future is dropped before `fut` finishes, cleanup is
    /// handed to a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the request can no longer be entered, or if the
    /// dispatch could not be exited cleanly.
    pub async fn dispatch<F: Future>(self: &Arc<Self>, fut: F) -> Result<F::Output, ContextError> {
        let ctx = Arc::clone(self);
        let body = async move {
            let mut guard = DispatchGuard::arm(Arc::clone(&ctx));
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            let exit = ctx.exit_dispatch().await;
            guard.disarm();
            (outcome, exit)
        };
        let (outcome, exit) = Scoped::new(Arc::clone(self), body, true).await?;

        match outcome {
            Ok(output) => exit.map(|_| output),
            Err(panic) => {
                if let Err(err) = exit {
                    warn!(request_id = %self.request_id, error = %err, "dispatch exit failed after handler panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Starts asynchronous processing for this request.
    ///
    /// Must be called while the request is entered, before its dispatch
    /// exits. The request is not cleaned up until the returned handle is
    /// completed or dropped, or the async deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AsyncAlreadyStarted`] on a second call and
    /// [`ContextError::IllegalState`] outside an entered dispatch.
    pub fn start_async(&self) -> Result<AsyncCompletion, ContextError> {
        let state = self.state.lock();
        if *state != ContextState::Entered {
            return Err(self.illegal("start async processing for", *state));
        }
        self.async_cycle
            .start()
            .ok_or_else(|| ContextError::AsyncAlreadyStarted {
                request_id: self.request_id.clone(),
            })
    }

    /// Called when the container's dispatch returns control.
    ///
    /// Runs the completion routine if no async processing was started,
    /// otherwise registers the one-shot completion listener. A second
    /// dispatch of an async request that is still pending is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] if the request was never
    /// entered or has already completed.
    pub async fn exit_dispatch(self: &Arc<Self>) -> Result<DispatchExit, ContextError> {
        let runtime = tokio::runtime::Handle::try_current();
        let async_started = {
            let mut state = self.state.lock();
            match *state {
                ContextState::Entered => {
                    // Without a runtime nothing could finish the request, so
                    // it stays entered and the exit can be retried.
                    if runtime.is_err() {
                        return Err(self.no_runtime());
                    }
                    let started = self.async_cycle.is_started();
                    *state = if started {
                        ContextState::AwaitingAsyncCompletion
                    } else {
                        ContextState::DispatchExited
                    };
                    started
                }
                ContextState::AwaitingAsyncCompletion => return Ok(DispatchExit::AwaitingCompletion),
                other => return Err(self.illegal("exit dispatch of", other)),
            }
        };
        let runtime = runtime.map_err(|_| self.no_runtime())?;

        if async_started {
            self.register_completion_listener(&runtime);
            debug!(request_id = %self.request_id, "dispatch exited with async processing pending");
            return Ok(DispatchExit::AwaitingCompletion);
        }

        // The routine runs on its own task so that dropping the dispatch
        // future mid-wait cannot leave the request half-completed.
        let ctx = Arc::clone(self);
        let handle = runtime.spawn(async move {
            ctx.on_complete(CompletionOutcome::synchronous()).await
        });
        let report = handle.await.map_err(|err| ContextError::CompletionAborted {
            request_id: self.request_id.clone(),
            reason: err.to_string(),
        })??;
        Ok(DispatchExit::Completed(report))
    }

    /// The completion routine.
    ///
    /// Interrupts attributed workers and waits up to the interrupt bound for
    /// them to stop, then waits up to the drain bound for in-flight API calls.
    /// Reaching a bound is logged, never an error.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] unless the dispatch has exited
    /// and the routine has not run yet.
    pub async fn on_complete(
        &self,
        outcome: CompletionOutcome,
    ) -> Result<CompletionReport, ContextError> {
        {
            let mut state = self.state.lock();
            match *state {
                ContextState::DispatchExited | ContextState::AwaitingAsyncCompletion => {
                    *state = ContextState::Completing;
                }
                other => return Err(self.illegal("complete", other)),
            }
        }

        let started = Instant::now();
        let activity = self.environment.activity();

        let workers_stopped = activity.interrupt_workers(self.limits.interrupt_wait).await;
        if !workers_stopped {
            metrics::counter!("vmrt_completion_interrupt_bound_reached_total").increment(1);
            warn!(
                request_id = %self.request_id,
                workers = activity.workers_running(),
                bound_ms = duration_ms(self.limits.interrupt_wait),
                "workers still running after interrupt bound, abandoning them"
            );
        }

        let api_calls_drained = activity.wait_for_api_calls(self.limits.api_call_wait).await;
        if !api_calls_drained {
            metrics::counter!("vmrt_completion_drain_bound_reached_total").increment(1);
            warn!(
                request_id = %self.request_id,
                api_calls = activity.api_calls_in_flight(),
                bound_ms = duration_ms(self.limits.api_call_wait),
                "API calls still in flight after drain bound"
            );
        }

        let report = CompletionReport {
            outcome,
            workers_stopped,
            api_calls_drained,
            elapsed: started.elapsed(),
        };
        metrics::counter!("vmrt_request_completions_total", "kind" => report.outcome.kind.as_str())
            .increment(1);
        *self.report.lock() = Some(report.clone());
        self.completions.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ContextState::Done;

        debug!(
            request_id = %self.request_id,
            kind = report.outcome.kind.as_str(),
            timed_out = report.outcome.timed_out,
            errors = report.outcome.errors.len(),
            elapsed_ms = duration_ms(report.elapsed),
            "request completed"
        );
        Ok(report)
    }

    /// Spawns `fut` as a worker attributed to this request.
    ///
    /// The worker runs with the request environment active and counts toward
    /// the environment's bookkeeping. When the request completes the worker
    /// is interrupted at its next await point and resolves to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IllegalState`] once completion has begun.
    pub fn spawn_worker<F>(
        self: &Arc<Self>,
        fut: F,
    ) -> Result<JoinHandle<Option<F::Output>>, ContextError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let state = self.state();
        if !state.accepts_entry() {
            return Err(self.illegal("spawn a worker for", state));
        }

        let worker = self.environment.activity().register_worker();
        let scoped = self.scope(fut);
        let request_id = self.request_id.clone();

        self.spawn_detached(async move {
            let interrupt = worker.interrupt_token().clone();
            let result = tokio::select! {
                biased;
                () = interrupt.cancelled() => {
                    debug!(request_id = %request_id, "worker interrupted");
                    None
                }
                result = scoped => result.ok(),
            };
            drop(worker);
            result
        })
    }

    pub(crate) fn begin_enter(&self, lifecycle: bool) -> Result<(), ContextError> {
        let mut state = self.state.lock();
        match *state {
            ContextState::Created if lifecycle => *state = ContextState::Entered,
            s if s.accepts_entry() => {}
            other => return Err(self.illegal("enter", other)),
        }
        drop(state);
        self.enters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn activate(&self) -> ActivationGuard {
        ActivationGuard::activate(&self.registry, Arc::clone(&self.environment))
    }

    pub(crate) fn record_exit(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn register_completion_listener(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        let Some(signal) = self.async_cycle.take_signal() else {
            return;
        };

        let ctx = Arc::clone(self);
        let deadline = self.limits.async_deadline;
        runtime.spawn(async move {
            let outcome = signal.wait(deadline).await;
            if outcome.kind == CompletionKind::DeadlineExceeded {
                warn!(
                    request_id = %ctx.request_id,
                    deadline_ms = duration_ms(deadline),
                    "async processing never completed, cleaning up at deadline"
                );
            }
            if let Err(err) = ctx.on_complete(outcome).await {
                warn!(request_id = %ctx.request_id, error = %err, "async completion failed");
            }
        });
    }

    /// Hands cleanup to a background task when a dispatch is dropped before
    /// it could exit.
    fn abandon_dispatch(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(request_id = %self.request_id, "dispatch dropped outside a runtime, cleanup not scheduled");
            return;
        };
        let async_started = {
            let mut state = self.state.lock();
            if *state != ContextState::Entered {
                return;
            }
            let started = self.async_cycle.is_started();
            *state = if started {
                ContextState::AwaitingAsyncCompletion
            } else {
                ContextState::DispatchExited
            };
            started
        };

        warn!(request_id = %self.request_id, "dispatch dropped before it exited");

        if async_started {
            self.register_completion_listener(&runtime);
        } else {
            let ctx = Arc::clone(self);
            runtime.spawn(async move {
                if let Err(err) = ctx.on_complete(CompletionOutcome::abandoned()).await {
                    warn!(request_id = %ctx.request_id, error = %err, "abandoned completion failed");
                }
            });
        }
    }

    fn spawn_detached<Fut>(&self, fut: Fut) -> Result<JoinHandle<Fut::Output>, ContextError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        tokio::runtime::Handle::try_current()
            .map(|handle| handle.spawn(fut))
            .map_err(|_| self.no_runtime())
    }

    fn no_runtime(&self) -> ContextError {
        ContextError::NoRuntime {
            request_id: self.request_id.clone(),
        }
    }

    fn illegal(&self, operation: &'static str, state: ContextState) -> ContextError {
        ContextError::IllegalState {
            request_id: self.request_id.clone(),
            operation,
            state,
        }
    }
}

/// Schedules cleanup if a dispatch is dropped between entering and exiting.
struct DispatchGuard {
    ctx: Option<Arc<RequestContext>>,
}

impl DispatchGuard {
    fn arm(ctx: Arc<RequestContext>) -> Self {
        Self { ctx: Some(ctx) }
    }

    fn disarm(&mut self) {
        self.ctx = None;
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.abandon_dispatch();
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;

    use futures_util::FutureExt;
    use tokio::sync::oneshot;
    use vmrt_core::{
        Endpoints, EnvironmentIdentity, ManualClock, RecordingRegistry, RequestAttributes,
    };

    use super::*;
    use crate::api::tests::EchoTransport;
    use crate::api::{ApiCall, ApiDelegate};

    const LIMITS: CompletionLimits = CompletionLimits {
        interrupt_wait: Duration::from_millis(100),
        api_call_wait: Duration::from_millis(100),
        async_deadline: Duration::from_secs(5),
    };

    struct Fixture {
        registry: Arc<RecordingRegistry>,
        ctx: Arc<RequestContext>,
    }

    fn fixture() -> Fixture {
        let default = Arc::new(Environment::host_default(
            EnvironmentIdentity {
                app_id: "app".to_string(),
                partition: "dev".to_string(),
                module: "default".to_string(),
                version: "1".to_string(),
                instance: "0".to_string(),
            },
            Endpoints::default(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(60),
        ));
        let env = Arc::new(default.derive_for_request(
            Some("ticket-r".to_string()),
            RequestAttributes {
                request_id: "r1".to_string(),
                ..RequestAttributes::default()
            },
        ));
        let registry = Arc::new(RecordingRegistry::new(default));
        let ctx = Arc::new(RequestContext::new(
            "r1",
            env,
            Arc::clone(&registry) as Arc<dyn EnvironmentRegistry>,
            LIMITS,
        ));
        Fixture { registry, ctx }
    }

    fn is_active(f: &Fixture) -> bool {
        Arc::ptr_eq(&f.registry.current(), f.ctx.environment())
    }

    fn assert_balanced(f: &Fixture) {
        assert_eq!(f.ctx.enter_count(), f.ctx.exit_count());
        assert_eq!(f.registry.activations(), f.registry.deactivations());
        assert!(f.registry.is_default_active());
    }

    #[tokio::test]
    async fn synchronous_dispatch_completes_once() {
        let f = fixture();
        let registry = Arc::clone(&f.registry);
        let env = Arc::clone(f.ctx.environment());

        let active = f
            .ctx
            .dispatch(async move { Arc::ptr_eq(&registry.current(), &env) })
            .await
            .unwrap();
        assert!(active);

        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(f.ctx.completion_count(), 1);
        assert_eq!(f.ctx.enter_count(), 1);
        let report = f.ctx.completion_report().unwrap();
        assert_eq!(report.outcome.kind, CompletionKind::Synchronous);
        assert!(report.workers_stopped);
        assert!(report.api_calls_drained);
        assert_balanced(&f);
    }

    #[tokio::test]
    async fn environment_is_active_across_awaits() {
        let f = fixture();
        let registry = Arc::clone(&f.registry);
        let env = Arc::clone(f.ctx.environment());

        let seen = f
            .ctx
            .dispatch(async move {
                let mut seen = Vec::new();
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                    seen.push(Arc::ptr_eq(&registry.current(), &env));
                }
                seen
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![true, true, true]);
        assert!(f.registry.activations() > 1);
        assert_balanced(&f);
    }

    #[tokio::test]
    async fn panicking_handler_still_exits_and_completes() {
        let f = fixture();

        let result = AssertUnwindSafe(f.ctx.dispatch(async { panic!("handler failed") }))
            .catch_unwind()
            .await;
        assert!(result.is_err());

        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(f.ctx.completion_count(), 1);
        assert_balanced(&f);
    }

    #[tokio::test(start_paused = true)]
    async fn async_request_completes_on_signal_and_drains_its_calls() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);

        let () = f
            .ctx
            .dispatch(async move {
                let completion = ctx.start_async().unwrap();
                let api_call = ctx.environment().activity().api_call();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    completion.complete();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    drop(api_call);
                });
            })
            .await
            .unwrap();

        assert_eq!(f.ctx.state(), ContextState::AwaitingAsyncCompletion);
        assert_eq!(f.ctx.completion_count(), 0);
        assert!(!is_active(&f));
        assert_balanced(&f);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(f.ctx.completion_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(f.ctx.completion_count(), 1);
        let report = f.ctx.completion_report().unwrap();
        assert_eq!(report.outcome.kind, CompletionKind::Completed);
        assert!(report.api_calls_drained);
        assert_eq!(f.ctx.environment().activity().api_calls_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_api_call_is_charged_to_the_async_request() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);
        let transport = Arc::new(EchoTransport {
            delay: Duration::from_millis(30),
            ..EchoTransport::default()
        });
        let delegate = ApiDelegate::new(
            Arc::clone(&f.registry) as Arc<dyn EnvironmentRegistry>,
            transport.clone(),
        );

        let () = f
            .ctx
            .dispatch(async move {
                let completion = ctx.start_async().unwrap();
                let call = delegate.make_call(ApiCall::new("memcache", "get", "k"));
                tokio::spawn(async move {
                    let _ = call.await;
                });
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    completion.complete();
                });
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.ctx.environment().activity().api_calls_in_flight(), 1);
        assert_eq!(f.registry.default_environment().activity().api_calls_in_flight(), 0);
        assert_eq!(f.ctx.completion_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert!(f.ctx.completion_report().unwrap().api_calls_drained);
        assert_eq!(*transport.tickets.lock(), vec!["ticket-r".to_string()]);
        assert_eq!(f.ctx.environment().activity().api_calls_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_timeout_does_not_complete() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);

        let completion = f
            .ctx
            .dispatch(async move { ctx.start_async().unwrap() })
            .await
            .unwrap();
        completion.record_timeout();
        completion.record_error("upstream reset");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.ctx.state(), ContextState::AwaitingAsyncCompletion);

        completion.complete();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let report = f.ctx.completion_report().unwrap();
        assert_eq!(report.outcome.kind, CompletionKind::Completed);
        assert!(report.outcome.timed_out);
        assert_eq!(report.outcome.errors, vec!["upstream reset".to_string()]);
    }

    #[tokio::test]
    async fn dropped_completion_handle_abandons_cycle() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);

        f.ctx
            .dispatch(async move { drop(ctx.start_async().unwrap()) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(
            f.ctx.completion_report().unwrap().outcome.kind,
            CompletionKind::Abandoned
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_async_cycle_is_cleaned_up_at_deadline() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);

        let completion = f
            .ctx
            .dispatch(async move { ctx.start_async().unwrap() })
            .await
            .unwrap();

        tokio::time::sleep(LIMITS.async_deadline + Duration::from_millis(10)).await;
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(
            f.ctx.completion_report().unwrap().outcome.kind,
            CompletionKind::DeadlineExceeded
        );

        // Completing late is harmless.
        completion.complete();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.ctx.completion_count(), 1);
    }

    #[tokio::test]
    async fn illegal_transitions_are_reported() {
        let f = fixture();

        assert!(matches!(
            f.ctx.start_async(),
            Err(ContextError::IllegalState { state: ContextState::Created, .. })
        ));
        assert!(matches!(
            f.ctx.exit_dispatch().await,
            Err(ContextError::IllegalState { .. })
        ));
        assert!(matches!(
            f.ctx.on_complete(CompletionOutcome::synchronous()).await,
            Err(ContextError::IllegalState { state: ContextState::Created, .. })
        ));

        f.ctx.dispatch(async {}).await.unwrap();

        assert!(matches!(
            f.ctx.enter(),
            Err(ContextError::IllegalState { state: ContextState::Done, .. })
        ));
        assert!(matches!(
            f.ctx.on_complete(CompletionOutcome::synchronous()).await,
            Err(ContextError::IllegalState { state: ContextState::Done, .. })
        ));
        assert!(f.ctx.dispatch(async {}).await.is_err());
        assert!(f.ctx.in_scope(|| ()).is_err());
        assert!(f.ctx.spawn_worker(async {}).is_err());
        assert_eq!(f.ctx.completion_count(), 1);
        assert_balanced(&f);
    }

    #[tokio::test]
    async fn async_start_is_one_shot() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);

        let second = f
            .ctx
            .dispatch(async move {
                let first = ctx.start_async().unwrap();
                let second = ctx.start_async();
                first.complete();
                second.map(drop)
            })
            .await
            .unwrap();
        assert!(matches!(second, Err(ContextError::AsyncAlreadyStarted { .. })));
    }

    #[tokio::test]
    async fn async_redispatch_leaves_cycle_pending() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);

        let completion = f
            .ctx
            .dispatch(async move { ctx.start_async().unwrap() })
            .await
            .unwrap();

        f.ctx.dispatch(async {}).await.unwrap();
        assert_eq!(f.ctx.state(), ContextState::AwaitingAsyncCompletion);
        assert_eq!(f.ctx.enter_count(), 2);

        completion.complete();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.ctx.completion_count(), 1);
        assert_balanced(&f);
    }

    #[tokio::test]
    async fn workers_run_in_the_request_environment_until_interrupted() {
        let f = fixture();
        let ctx = Arc::clone(&f.ctx);
        let registry = Arc::clone(&f.registry);
        let env = Arc::clone(f.ctx.environment());

        let (worker, seen) = f
            .ctx
            .dispatch(async move {
                let (tx, rx) = oneshot::channel();
                let worker = ctx
                    .spawn_worker(async move {
                        let _ = tx.send(Arc::ptr_eq(&registry.current(), &env));
                        tokio::time::sleep(Duration::from_secs(3_600)).await;
                    })
                    .unwrap();
                (worker, rx.await.unwrap())
            })
            .await
            .unwrap();

        assert!(seen);
        assert_eq!(worker.await.unwrap(), None);
        assert_eq!(f.ctx.environment().activity().workers_running(), 0);
        assert!(f.ctx.completion_report().unwrap().workers_stopped);
        assert_balanced(&f);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_is_bounded_when_work_never_finishes() {
        let f = fixture();
        let activity = f.ctx.environment().activity();
        let _stuck_worker = activity.register_worker();
        let _stuck_call = activity.api_call();

        let started = Instant::now();
        f.ctx.dispatch(async {}).await.unwrap();
        let waited = started.elapsed();

        let report = f.ctx.completion_report().unwrap();
        assert!(!report.workers_stopped);
        assert!(!report.api_calls_drained);
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert!(waited >= LIMITS.interrupt_wait + LIMITS.api_call_wait);
        assert!(waited < LIMITS.interrupt_wait + LIMITS.api_call_wait + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_dispatch_is_cleaned_up() {
        let f = fixture();

        let dispatch = f
            .ctx
            .dispatch(tokio::time::sleep(Duration::from_secs(3_600)));
        assert!(tokio::time::timeout(Duration::from_secs(1), dispatch)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(
            f.ctx.completion_report().unwrap().outcome.kind,
            CompletionKind::Abandoned
        );
        assert_balanced(&f);
    }

    #[tokio::test]
    async fn ad_hoc_scope_leaves_lifecycle_alone() {
        let f = fixture();

        let active = f.ctx.in_scope(|| is_active(&f)).unwrap();
        assert!(active);
        assert_eq!(f.ctx.state(), ContextState::Created);

        let registry = Arc::clone(&f.registry);
        let env = Arc::clone(f.ctx.environment());
        let scoped = f
            .ctx
            .scope(async move { Arc::ptr_eq(&registry.current(), &env) })
            .await
            .unwrap();
        assert!(scoped);
        assert_eq!(f.ctx.state(), ContextState::Created);
        assert_eq!(f.ctx.enter_count(), 2);
        assert_balanced(&f);
    }

    #[test]
    fn explicit_enter_moves_to_entered_and_nests() {
        let f = fixture();
        {
            let _outer = f.ctx.enter().unwrap();
            assert_eq!(f.ctx.state(), ContextState::Entered);
            {
                let _inner = f.ctx.enter().unwrap();
                assert!(is_active(&f));
            }
            assert!(is_active(&f));
        }
        assert!(f.registry.is_default_active());
        assert_eq!(f.ctx.enter_count(), 2);
        assert_eq!(f.ctx.exit_count(), 2);
    }

    #[test]
    fn exit_without_runtime_keeps_request_entered_for_retry() {
        let f = fixture();
        let guard = f.ctx.enter().unwrap();
        let exit = futures_util::FutureExt::now_or_never(f.ctx.exit_dispatch());
        assert!(matches!(exit, Some(Err(ContextError::NoRuntime { .. }))));
        assert_eq!(f.ctx.state(), ContextState::Entered);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let exit = runtime.block_on(f.ctx.exit_dispatch()).unwrap();
        assert!(matches!(exit, DispatchExit::Completed(_)));
        assert_eq!(f.ctx.state(), ContextState::Done);
        assert_eq!(f.ctx.completion_count(), 1);
        drop(guard);
        assert_balanced(&f);
    }
}
