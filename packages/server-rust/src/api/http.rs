//! HTTP transport to the API server.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use vmrt_core::{headers, Environment};

use super::{ApiCall, ApiTransport};

/// Path on the API server accepting raw call payloads.
const RPC_PATH: &str = "rpc_http";

/// Posts each call's payload to `http://{api_address}/rpc_http`.
///
/// The environment's ticket, the target service and method, and the deadline
/// travel as headers.
#[derive(Debug, Clone, Default)]
pub struct HttpApiTransport {
    client: reqwest::Client,
}

impl HttpApiTransport {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(api_address: &str) -> String {
        format!("http://{api_address}/{RPC_PATH}")
    }
}

#[async_trait]
impl ApiTransport for HttpApiTransport {
    async fn send(&self, env: &Environment, call: &ApiCall, deadline: Duration) -> anyhow::Result<Bytes> {
        let response = self
            .client
            .post(Self::url(&env.endpoints().api_address))
            .timeout(deadline)
            .header(headers::API_TICKET, env.ticket())
            .header(headers::API_SERVICE, call.service.as_str())
            .header(headers::API_METHOD, call.method.as_str())
            .header(headers::API_DEADLINE_MS, deadline.as_millis().to_string())
            .body(call.payload.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?)
    }
}
