//! HTTP serving: configuration, middleware, probes, and shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use module::HostServer;
pub use shutdown::{HealthState, ShutdownController};
