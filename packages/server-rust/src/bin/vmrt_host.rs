//! Multi-tenant application host.
//!
//! Resolves the host default environment, loads the application config,
//! and serves HTTP until Ctrl-C.

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::info;

use vmrt_server::host::{HostConfig, HostContext, HostOptions};
use vmrt_server::logging::init_tracing;
use vmrt_server::network::HostServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::parse();
    init_tracing(config.log_json);

    let options = HostOptions::from_config(&config).context("invalid host configuration")?;
    let host = HostContext::init(options)
        .await
        .context("failed to initialize host context")?;

    let app = Router::new().route("/", get(|| async { "ok" }));
    let mut server = HostServer::new(config.network_config(), host, app);
    let port = server.start().await?;
    info!(port, "vmrt host listening");

    server
        .serve(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await
}
