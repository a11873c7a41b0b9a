//! Diagnostic view of the environment a request runs in.

use std::sync::Arc;

use axum::{Extension, Json};
use serde_json::json;

use crate::context::RequestContext;

/// Describes the calling request's environment. Mounted behind the request
/// context layer, so the context is always present.
pub async fn environment_handler(
    Extension(ctx): Extension<Arc<RequestContext>>,
) -> Json<serde_json::Value> {
    let env = ctx.environment();
    let request = env.request();

    Json(json!({
        "request_id": ctx.request_id(),
        "state": ctx.state().as_str(),
        "identity": env.identity(),
        "dev_mode": env.is_dev(),
        "skip_admin_check": env.skip_admin_check(),
        "user_email": request.and_then(|r| r.user_email.as_deref()),
        "is_admin": request.is_some_and(|r| r.is_admin),
        "https": request.is_some_and(|r| r.https),
        "remote_addr": request.and_then(|r| r.remote_addr.as_deref()),
        "remaining_ms": u64::try_from(env.remaining().as_millis()).unwrap_or(u64::MAX),
    }))
}
