//! Metadata collaborator used to resolve the host's identity.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Key/value attributes describing the instance the host runs on.
#[async_trait]
pub trait MetadataSource: Send + Sync + fmt::Debug {
    /// Looks up a single attribute. `Ok(None)` means the attribute is not set.
    async fn attribute(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Fixed attribute map. With no attributes it stands in for hosts that have
/// no metadata server.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    attributes: HashMap<String, String>,
}

impl StaticMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn attribute(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.attributes.get(key).cloned())
    }
}

/// Reads instance attributes from an HTTP metadata server.
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataSource {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn attribute_url(&self, key: &str) -> String {
        format!(
            "{}/computeMetadata/v1/instance/attributes/{key}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn attribute(&self, key: &str) -> anyhow::Result<Option<String>> {
        let response = self
            .client
            .get(self.attribute_url(key))
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.text().await?;
        Ok(Some(body.trim().to_string()))
    }
}
