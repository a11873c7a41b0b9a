//! HTTP handlers served by the host itself.
//!
//! `AppState` is the shared state carried through axum extractors for the
//! probe routes.

pub mod environment;
pub mod health;

pub use environment::environment_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::host::HostContext;

#[derive(Debug, Clone)]
pub struct AppState {
    pub host: Arc<HostContext>,
    pub shutdown: Arc<ShutdownController>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
