//! HTTP server with deferred startup.
//!
//! `new()` assembles shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until shutdown. Application routes run
//! behind the request context layer; probe routes do not.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    environment_handler, health_handler, liveness_handler, readiness_handler, AppState,
};
use super::middleware::{build_http_layers, track_in_flight};
use super::shutdown::ShutdownController;
use crate::context::RequestContextLayer;
use crate::host::HostContext;

/// Path of the request environment diagnostic route.
pub const ENVIRONMENT_PATH: &str = "/_vmrt/environment";

pub struct HostServer {
    config: NetworkConfig,
    host: Arc<HostContext>,
    app: Router,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl HostServer {
    /// Creates the server without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, host: Arc<HostContext>, app: Router) -> Self {
        Self {
            config,
            host,
            app,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the full router.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `GET /_vmrt/environment` -- the calling request's environment
    /// - everything the application router serves
    pub fn build_router(&self) -> Router {
        let state = AppState {
            host: Arc::clone(&self.host),
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        };

        let probes = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .with_state(state);

        let app = self
            .app
            .clone()
            .route(ENVIRONMENT_PATH, get(environment_handler))
            .layer(RequestContextLayer::new(Arc::clone(&self.host)));

        probes
            .merge(app)
            .layer(from_fn_with_state(Arc::clone(&self.shutdown), track_in_flight))
            .layer(build_http_layers(&self.config))
    }

    /// Binds the TCP listener and returns the bound port, which differs from
    /// the configured one when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests and
    /// flushes queued session writes, each within the drain timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        self.shutdown.set_ready();
        info!("serving HTTP connections");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        self.shutdown.trigger_shutdown();
        let drain_timeout = self.config.drain_timeout;
        if self.shutdown.wait_for_drain(drain_timeout).await {
            info!("all in-flight requests drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with in-flight requests remaining"
            );
        }

        if let Some(sessions) = self.host.sessions() {
            if !sessions.flush(drain_timeout).await {
                warn!("queued session writes were still pending at shutdown");
            }
        }
        Ok(())
    }
}
