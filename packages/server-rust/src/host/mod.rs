//! Host initialization.
//!
//! [`HostContext`] is built once at startup. It resolves the default
//! environment, installs the environment registry, loads the application
//! configuration and assembles the session store chain. Per request it
//! derives the request environment and its [`RequestContext`].

pub mod config;
pub mod factory;
pub mod metadata;

pub use config::{AppConfig, ConfigError, HostConfig};
pub use factory::{EnvironmentError, EnvironmentFactory};
pub use metadata::{HttpMetadataSource, MetadataSource, StaticMetadata};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::info;
use uuid::Uuid;
use vmrt_core::{
    headers, is_trusted, Clock, Environment, EnvironmentRegistry, SystemClock, ThreadLocalRegistry,
    TrustedAddressChecker,
};

use crate::api::{ApiDelegate, ApiTransport};
use crate::context::{CompletionLimits, RequestContext};
use crate::session::{create_session_stores, Datastore, MemoryDatastore, SessionError, SessionStoreChain};

/// Prefix of process env vars forwarded to environment resolution.
const ENV_PREFIX: &str = "VMRT_";

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("host startup failed: {0:#}")]
    Startup(anyhow::Error),
}

/// Everything [`HostContext::init`] needs, with collaborators injected.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub env_vars: HashMap<String, String>,
    pub metadata: Arc<dyn MetadataSource>,
    pub metadata_timeout: Duration,
    pub api_address: String,
    pub server_host: String,
    pub server_port: u16,
    pub clock: Arc<dyn Clock>,
    pub long_timeout: Duration,
    pub app_dir: PathBuf,
    pub app_config_file: String,
    pub limits: CompletionLimits,
    pub session_datastore: Arc<dyn Datastore>,
}

impl HostOptions {
    /// Production options: process env vars, the configured metadata server
    /// and the configured session database.
    ///
    /// # Errors
    ///
    /// Fails if the metadata client or the session database cannot be opened.
    pub fn from_config(config: &HostConfig) -> Result<Self, HostError> {
        let metadata: Arc<dyn MetadataSource> = match &config.metadata_url {
            Some(url) => Arc::new(
                HttpMetadataSource::new(url.clone(), Duration::from_millis(config.metadata_timeout_ms))
                    .map_err(HostError::Startup)?,
            ),
            None => Arc::new(StaticMetadata::new()),
        };

        Ok(Self {
            env_vars: std::env::vars()
                .filter(|(key, _)| key.starts_with(ENV_PREFIX))
                .collect(),
            metadata,
            metadata_timeout: Duration::from_millis(config.metadata_timeout_ms),
            api_address: config.api_address.clone(),
            server_host: config.host.clone(),
            server_port: config.port,
            clock: Arc::new(SystemClock),
            long_timeout: Duration::from_millis(config.long_timeout_ms),
            app_dir: config.app_dir.clone(),
            app_config_file: config.app_config_file.clone(),
            limits: config.completion_limits(),
            session_datastore: open_datastore(config)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            env_vars: HashMap::from([
                ("VMRT_APP_ID".to_string(), "app".to_string()),
                ("VMRT_PARTITION".to_string(), "dev".to_string()),
            ]),
            metadata: Arc::new(StaticMetadata::new()),
            metadata_timeout: Duration::from_millis(100),
            api_address: "localhost:10001".to_string(),
            server_host: "localhost".to_string(),
            server_port: 8080,
            clock: Arc::new(vmrt_core::ManualClock::new(0)),
            long_timeout: Duration::from_secs(60),
            app_dir: PathBuf::from("/nonexistent"),
            app_config_file: "vmrt-app.json".to_string(),
            limits: CompletionLimits {
                interrupt_wait: Duration::from_millis(100),
                api_call_wait: Duration::from_millis(100),
                async_deadline: Duration::from_secs(5),
            },
            session_datastore: Arc::new(MemoryDatastore::new()),
        }
    }
}

#[cfg(feature = "redb")]
fn open_datastore(config: &HostConfig) -> Result<Arc<dyn Datastore>, HostError> {
    match &config.session_db {
        Some(path) => Ok(Arc::new(
            crate::session::RedbDatastore::open(path).map_err(HostError::Startup)?,
        )),
        None => Ok(Arc::new(MemoryDatastore::new())),
    }
}

#[cfg(not(feature = "redb"))]
fn open_datastore(config: &HostConfig) -> Result<Arc<dyn Datastore>, HostError> {
    match &config.session_db {
        Some(path) => Err(HostError::Startup(anyhow::anyhow!(
            "session database {} requires the redb feature",
            path.display()
        ))),
        None => Ok(Arc::new(MemoryDatastore::new())),
    }
}

/// Host-wide state shared by every request.
#[derive(Debug)]
pub struct HostContext {
    registry: Arc<dyn EnvironmentRegistry>,
    factory: EnvironmentFactory,
    limits: CompletionLimits,
    app_config: Option<AppConfig>,
    sessions: Option<SessionStoreChain>,
}

impl HostContext {
    /// Initializes the host with the thread-local registry.
    ///
    /// # Errors
    ///
    /// Fails if the default environment cannot be resolved, the application
    /// configuration is malformed, or the session stores cannot be built.
    pub async fn init(options: HostOptions) -> Result<Arc<Self>, HostError> {
        Self::init_with_registry(options, |default| Arc::new(ThreadLocalRegistry::new(default)))
            .await
    }

    /// Initializes the host with a caller-supplied registry built around the
    /// resolved default environment.
    ///
    /// # Errors
    ///
    /// Same as [`HostContext::init`].
    pub async fn init_with_registry(
        options: HostOptions,
        make_registry: impl FnOnce(Arc<Environment>) -> Arc<dyn EnvironmentRegistry>,
    ) -> Result<Arc<Self>, HostError> {
        let default = Arc::new(EnvironmentFactory::resolve_default(&options).await?);
        let registry = make_registry(Arc::clone(&default));

        let app_config = AppConfig::load(&options.app_dir, &options.app_config_file)?;
        let sessions = match &app_config {
            Some(config) if config.sessions_enabled => Some(create_session_stores(
                config,
                Arc::clone(&options.session_datastore),
                Arc::clone(&options.clock),
            )?),
            _ => None,
        };

        info!(
            app_id = %default.identity().app_id,
            partition = default.partition(),
            module = %default.identity().module,
            version = %default.identity().version,
            dev_mode = default.is_dev(),
            app_config = app_config.is_some(),
            sessions = ?sessions.as_ref().map(SessionStoreChain::kinds),
            "host initialized"
        );

        Ok(Arc::new(Self {
            registry,
            factory: EnvironmentFactory::new(default),
            limits: options.limits,
            app_config,
            sessions,
        }))
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn EnvironmentRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn default_environment(&self) -> &Arc<Environment> {
        self.factory.default_environment()
    }

    #[must_use]
    pub fn is_dev_mode(&self) -> bool {
        self.default_environment().is_dev()
    }

    #[must_use]
    pub fn limits(&self) -> CompletionLimits {
        self.limits
    }

    /// Application configuration, if the application ships one.
    #[must_use]
    pub fn app_config(&self) -> Option<&AppConfig> {
        self.app_config.as_ref()
    }

    /// Session stores, if the application enables sessions.
    #[must_use]
    pub fn sessions(&self) -> Option<&SessionStoreChain> {
        self.sessions.as_ref()
    }

    /// Returns the request's context, creating it on first use.
    ///
    /// The context is stored in the request extensions, so nested
    /// dispatches of the same request share it.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvironmentError`] if the request environment cannot be
    /// derived from the request headers.
    pub fn request_context<B>(
        &self,
        request: &mut Request<B>,
    ) -> Result<Arc<RequestContext>, EnvironmentError> {
        if let Some(existing) = request.extensions().get::<Arc<RequestContext>>() {
            return Ok(Arc::clone(existing));
        }

        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());
        let request_id = request
            .headers()
            .get(headers::REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

        let environment =
            self.factory
                .for_request(request_id.clone(), request.headers(), remote_addr.as_deref())?;
        let ctx = Arc::new(RequestContext::new(
            request_id,
            Arc::new(environment),
            Arc::clone(&self.registry),
            self.limits,
        ));
        request.extensions_mut().insert(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Outbound API delegate attributing calls to the active environment.
    #[must_use]
    pub fn api_delegate(&self, transport: Arc<dyn ApiTransport>) -> ApiDelegate {
        ApiDelegate::new(Arc::clone(&self.registry), transport)
    }
}

impl TrustedAddressChecker for HostContext {
    fn is_trusted_remote_addr(&self, remote_addr: Option<&str>) -> bool {
        is_trusted(self.is_dev_mode(), remote_addr)
    }
}
