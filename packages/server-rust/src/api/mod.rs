//! Outbound API calls attributed to an environment.
//!
//! Every call holds an in-flight guard on its environment's bookkeeping for
//! as long as the transport runs, so request completion can wait for the
//! call to drain.

pub mod http;

pub use self::http::HttpApiTransport;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use vmrt_core::{Environment, EnvironmentRegistry, InFlightGuard};

/// Deadline used when the caller does not pick one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// One outbound call. The payload is opaque to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub service: String,
    pub method: String,
    pub payload: Bytes,
}

impl ApiCall {
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            payload: payload.into(),
        }
    }
}

/// Carries a call to the API server.
#[async_trait]
pub trait ApiTransport: Send + Sync + fmt::Debug {
    async fn send(&self, env: &Environment, call: &ApiCall, deadline: Duration) -> anyhow::Result<Bytes>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{service}.{method} failed: {source}")]
    Transport {
        service: String,
        method: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{service}.{method} exceeded its {deadline_ms}ms deadline")]
    DeadlineExceeded {
        service: String,
        method: String,
        deadline_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct ApiDelegate {
    registry: Arc<dyn EnvironmentRegistry>,
    transport: Arc<dyn ApiTransport>,
    deadline: Duration,
}

impl ApiDelegate {
    #[must_use]
    pub fn new(registry: Arc<dyn EnvironmentRegistry>, transport: Arc<dyn ApiTransport>) -> Self {
        Self {
            registry,
            transport,
            deadline: DEFAULT_DEADLINE,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Makes `call` on behalf of the environment active on the calling thread.
    ///
    /// The environment is captured and its in-flight count raised before this
    /// returns, so the future can be moved to another task and still be
    /// charged to the caller's request.
    ///
    /// # Errors
    ///
    /// See [`ApiDelegate::make_call_in`].
    pub fn make_call(
        &self,
        call: ApiCall,
    ) -> impl Future<Output = Result<Bytes, ApiError>> + Send + 'static {
        let env = self.registry.current();
        let in_flight = env.activity().api_call();
        let delegate = self.clone();
        async move { delegate.send(&env, call, in_flight).await }
    }

    /// Makes `call` on behalf of `env`.
    ///
    /// The deadline is the delegate's deadline, capped by the time `env` has
    /// left before its long timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::DeadlineExceeded`] if the transport does not answer
    /// in time and [`ApiError::Transport`] if it fails.
    pub async fn make_call_in(&self, env: &Environment, call: ApiCall) -> Result<Bytes, ApiError> {
        let in_flight = env.activity().api_call();
        self.send(env, call, in_flight).await
    }

    async fn send(
        &self,
        env: &Environment,
        call: ApiCall,
        _in_flight: InFlightGuard,
    ) -> Result<Bytes, ApiError> {
        let deadline = self.deadline.min(env.remaining());
        let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        debug!(
            service = %call.service,
            method = %call.method,
            deadline_ms,
            "api call"
        );

        match tokio::time::timeout(deadline, self.transport.send(env, &call, deadline)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(ApiError::Transport {
                service: call.service,
                method: call.method,
                source,
            }),
            Err(_) => Err(ApiError::DeadlineExceeded {
                service: call.service,
                method: call.method,
                deadline_ms,
            }),
        }
    }
}
