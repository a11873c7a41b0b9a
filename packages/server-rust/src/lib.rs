//! vmrt server: request-scoped execution contexts for a multi-tenant host.
//!
//! Each inbound request gets an [`Environment`](vmrt_core::Environment)
//! derived from the host default. A [`RequestContext`](context::RequestContext)
//! keeps it active while the handler runs, completes it exactly once, and
//! restores the default afterwards.

pub mod api;
pub mod context;
pub mod host;
pub mod logging;
pub mod network;
pub mod session;
