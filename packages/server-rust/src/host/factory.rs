//! Building environments: the host default at startup and one per request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::warn;
use vmrt_core::{headers, is_trusted, Endpoints, Environment, EnvironmentIdentity, RequestAttributes};

use super::metadata::MetadataSource;
use super::HostOptions;

/// Process environment variables consulted before the metadata server.
pub mod env_keys {
    pub const APP_ID: &str = "VMRT_APP_ID";
    pub const PARTITION: &str = "VMRT_PARTITION";
    pub const MODULE: &str = "VMRT_MODULE";
    pub const VERSION: &str = "VMRT_VERSION";
    pub const INSTANCE: &str = "VMRT_INSTANCE";
    pub const SERVER_PORT: &str = "VMRT_SERVER_PORT";
}

/// Metadata attribute names, one per identity field.
pub mod metadata_keys {
    pub const APP_ID: &str = "vmrt_app_id";
    pub const PARTITION: &str = "vmrt_partition";
    pub const MODULE: &str = "vmrt_module";
    pub const VERSION: &str = "vmrt_version";
    pub const INSTANCE: &str = "vmrt_instance";
}

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("metadata lookup for {key} failed: {source}")]
    Lookup {
        key: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("metadata lookup for {key} timed out after {timeout_ms}ms")]
    LookupTimeout { key: &'static str, timeout_ms: u64 },
    #[error("missing required identity attribute {0}")]
    MissingIdentity(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("request carries no API ticket")]
    MissingTicket,
}

impl IntoResponse for EnvironmentError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::InvalidValue { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Resolves identity attributes from env vars, falling back to metadata.
struct AttributeResolver<'a> {
    env_vars: &'a HashMap<String, String>,
    metadata: &'a dyn MetadataSource,
    timeout: Duration,
}

impl AttributeResolver<'_> {
    async fn lookup(
        &self,
        env_key: &'static str,
        metadata_key: &'static str,
    ) -> Result<Option<String>, EnvironmentError> {
        if let Some(value) = self.env_vars.get(env_key).filter(|v| !v.is_empty()) {
            return Ok(Some(value.clone()));
        }

        match tokio::time::timeout(self.timeout, self.metadata.attribute(metadata_key)).await {
            Ok(Ok(value)) => Ok(value.filter(|v| !v.is_empty())),
            Ok(Err(source)) => Err(EnvironmentError::Lookup {
                key: metadata_key,
                source,
            }),
            Err(_) => Err(EnvironmentError::LookupTimeout {
                key: metadata_key,
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn required(
        &self,
        env_key: &'static str,
        metadata_key: &'static str,
    ) -> Result<String, EnvironmentError> {
        self.lookup(env_key, metadata_key)
            .await?
            .ok_or(EnvironmentError::MissingIdentity(metadata_key))
    }

    async fn or_default(
        &self,
        env_key: &'static str,
        metadata_key: &'static str,
        default: &str,
    ) -> Result<String, EnvironmentError> {
        Ok(self
            .lookup(env_key, metadata_key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }
}

/// Builds request-specific environments from the host default.
#[derive(Debug, Clone)]
pub struct EnvironmentFactory {
    default: Arc<Environment>,
}

impl EnvironmentFactory {
    #[must_use]
    pub fn new(default: Arc<Environment>) -> Self {
        Self { default }
    }

    /// Resolves the host default environment.
    ///
    /// # Errors
    ///
    /// Fails if a required attribute is missing, a metadata lookup fails or
    /// times out, or the server port override is not a port number.
    pub async fn resolve_default(options: &HostOptions) -> Result<Environment, EnvironmentError> {
        let resolver = AttributeResolver {
            env_vars: &options.env_vars,
            metadata: options.metadata.as_ref(),
            timeout: options.metadata_timeout,
        };

        let identity = EnvironmentIdentity {
            app_id: resolver.required(env_keys::APP_ID, metadata_keys::APP_ID).await?,
            partition: resolver
                .required(env_keys::PARTITION, metadata_keys::PARTITION)
                .await?,
            module: resolver
                .or_default(env_keys::MODULE, metadata_keys::MODULE, "default")
                .await?,
            version: resolver
                .or_default(env_keys::VERSION, metadata_keys::VERSION, "1")
                .await?,
            instance: resolver
                .or_default(env_keys::INSTANCE, metadata_keys::INSTANCE, "0")
                .await?,
        };

        let server_port = match options.env_vars.get(env_keys::SERVER_PORT) {
            Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| {
                EnvironmentError::InvalidValue {
                    name: env_keys::SERVER_PORT,
                    reason: e.to_string(),
                }
            })?,
            None => options.server_port,
        };

        Ok(Environment::host_default(
            identity,
            Endpoints {
                server_host: options.server_host.clone(),
                server_port,
                api_address: options.api_address.clone(),
            },
            Arc::clone(&options.clock),
            options.long_timeout,
        ))
    }

    #[must_use]
    pub fn default_environment(&self) -> &Arc<Environment> {
        &self.default
    }

    /// Derives the environment for one request from its headers.
    ///
    /// The admin-check bypass is only granted when the request asks for it
    /// and `remote_addr` is trusted.
    ///
    /// # Errors
    ///
    /// Fails on a header that is not valid text, and on a missing API
    /// ticket outside dev mode.
    pub fn for_request(
        &self,
        request_id: String,
        request_headers: &HeaderMap,
        remote_addr: Option<&str>,
    ) -> Result<Environment, EnvironmentError> {
        let dev_mode = self.default.is_dev();

        let ticket = header(request_headers, headers::API_TICKET)?;
        if ticket.is_none() && !dev_mode {
            return Err(EnvironmentError::MissingTicket);
        }

        let bypass_requested = request_headers.contains_key(headers::SKIP_ADMIN_CHECK)
            || request_headers.contains_key(headers::QUEUE_NAME);
        let skip_admin_check = bypass_requested && is_trusted(dev_mode, remote_addr);
        if bypass_requested && !skip_admin_check {
            warn!(
                request_id = %request_id,
                remote_addr = remote_addr.unwrap_or("unknown"),
                "ignoring admin-check bypass from untrusted address"
            );
        }

        let attributes = RequestAttributes {
            user_email: header(request_headers, headers::USER_EMAIL)?,
            user_id: header(request_headers, headers::USER_ID)?,
            is_admin: header(request_headers, headers::USER_IS_ADMIN)?.as_deref() == Some("1"),
            skip_admin_check,
            https: header(request_headers, headers::HTTPS)?.as_deref() == Some("on"),
            remote_addr: remote_addr.map(str::to_string),
            request_log_id: header(request_headers, headers::REQUEST_LOG_ID)?,
            trace_context: header(request_headers, headers::TRACE_CONTEXT)?,
            request_id,
        };

        Ok(self.default.derive_for_request(ticket, attributes))
    }
}

fn header(map: &HeaderMap, name: &'static str) -> Result<Option<String>, EnvironmentError> {
    map.get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| EnvironmentError::InvalidValue {
                    name,
                    reason: "header is not visible ASCII".to_string(),
                })
        })
        .transpose()
}
