//! Request headers set by the platform front end.
//!
//! Header names are lowercase so they can be used with `http::HeaderName::from_static`.

/// Per-request API ticket used to attribute outbound calls.
pub const API_TICKET: &str = "x-vmrt-api-ticket";
/// Email of the signed-in user, if any.
pub const USER_EMAIL: &str = "x-vmrt-user-email";
/// Stable id of the signed-in user, if any.
pub const USER_ID: &str = "x-vmrt-user-id";
/// `"1"` when the signed-in user is an administrator.
pub const USER_IS_ADMIN: &str = "x-vmrt-user-is-admin";
/// `"on"` when the original request arrived over HTTPS.
pub const HTTPS: &str = "x-vmrt-https";
/// Request log id assigned by the front end.
pub const REQUEST_LOG_ID: &str = "x-vmrt-request-log-id";
/// Asks the runtime to bypass administrative checks. Honored from trusted addresses only.
pub const SKIP_ADMIN_CHECK: &str = "x-vmrt-skip-admin-check";
/// Present on task-queue deliveries. Implies the admin-check bypass from trusted addresses.
pub const QUEUE_NAME: &str = "x-vmrt-queue-name";
/// Distributed trace context.
pub const TRACE_CONTEXT: &str = "x-cloud-trace-context";
/// Request id assigned by the HTTP layer.
pub const REQUEST_ID: &str = "x-request-id";

/// Outbound API call headers.
pub const API_SERVICE: &str = "x-vmrt-api-service";
pub const API_METHOD: &str = "x-vmrt-api-method";
/// Deadline of an outbound API call in milliseconds.
pub const API_DEADLINE_MS: &str = "x-vmrt-api-deadline-ms";
