//! The environment attached to outbound API calls.
//!
//! An [`Environment`] says who is making outbound calls and under what limits.
//! The host builds one default environment at startup and derives a
//! request-specific one for every inbound request. Identity fields never
//! change after construction; only the [`ActivityTracker`] mutates.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::activity::ActivityTracker;
use crate::clock::Clock;

/// Partition name reported by the local development server.
pub const DEV_PARTITION: &str = "dev";

/// Who the application is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentIdentity {
    pub app_id: String,
    pub partition: String,
    pub module: String,
    pub version: String,
    pub instance: String,
}

/// Where the application and the API server live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub server_host: String,
    pub server_port: u16,
    /// `host:port` of the outbound API server.
    pub api_address: String,
}

/// Attributes only a request-specific environment carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub request_id: String,
    pub user_email: Option<String>,
    pub user_id: Option<String>,
    pub is_admin: bool,
    /// Whether administrative checks are bypassed. Only ever set for requests
    /// from trusted addresses.
    pub skip_admin_check: bool,
    pub https: bool,
    pub remote_addr: Option<String>,
    pub request_log_id: Option<String>,
    pub trace_context: Option<String>,
}

#[derive(Debug)]
pub struct Environment {
    identity: EnvironmentIdentity,
    endpoints: Endpoints,
    ticket: String,
    request: Option<RequestAttributes>,
    clock: Arc<dyn Clock>,
    started_at_millis: i64,
    long_timeout: Duration,
    activity: ActivityTracker,
}

impl Environment {
    /// Builds the host-wide default environment.
    ///
    /// The default ticket is derived from the identity so that calls made
    /// outside any request can still be attributed to the application.
    #[must_use]
    pub fn host_default(
        identity: EnvironmentIdentity,
        endpoints: Endpoints,
        clock: Arc<dyn Clock>,
        long_timeout: Duration,
    ) -> Self {
        let ticket = format!(
            "{}/{}.{}.{}",
            identity.app_id, identity.module, identity.version, identity.instance
        );
        let started_at_millis = clock.now_millis();
        Self {
            identity,
            endpoints,
            ticket,
            request: None,
            clock,
            started_at_millis,
            long_timeout,
            activity: ActivityTracker::new(),
        }
    }

    /// Derives a request-specific environment from this (default) environment.
    ///
    /// Identity, endpoints, clock and long timeout are inherited. Bookkeeping
    /// starts empty so the request's outstanding work is tracked on its own.
    /// A missing ticket falls back to the default environment's ticket.
    #[must_use]
    pub fn derive_for_request(&self, ticket: Option<String>, request: RequestAttributes) -> Self {
        Self {
            identity: self.identity.clone(),
            endpoints: self.endpoints.clone(),
            ticket: ticket.unwrap_or_else(|| self.ticket.clone()),
            request: Some(request),
            clock: Arc::clone(&self.clock),
            started_at_millis: self.clock.now_millis(),
            long_timeout: self.long_timeout,
            activity: ActivityTracker::new(),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &EnvironmentIdentity {
        &self.identity
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    #[must_use]
    pub fn partition(&self) -> &str {
        &self.identity.partition
    }

    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.identity.partition == DEV_PARTITION
    }

    #[must_use]
    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    /// Request attributes, or `None` for the host default environment.
    #[must_use]
    pub fn request(&self) -> Option<&RequestAttributes> {
        self.request.as_ref()
    }

    #[must_use]
    pub fn is_request_specific(&self) -> bool {
        self.request.is_some()
    }

    #[must_use]
    pub fn skip_admin_check(&self) -> bool {
        self.request.as_ref().is_some_and(|r| r.skip_admin_check)
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn long_timeout(&self) -> Duration {
        self.long_timeout
    }

    /// Time left before the long timeout, measured from construction.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        let elapsed = self.clock.now_millis().saturating_sub(self.started_at_millis);
        let elapsed = Duration::from_millis(u64::try_from(elapsed).unwrap_or(0));
        self.long_timeout.saturating_sub(elapsed)
    }

    #[must_use]
    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn identity(partition: &str) -> EnvironmentIdentity {
        EnvironmentIdentity {
            app_id: "guestbook".to_string(),
            partition: partition.to_string(),
            module: "default".to_string(),
            version: "v1".to_string(),
            instance: "0".to_string(),
        }
    }

    fn endpoints() -> Endpoints {
        Endpoints {
            server_host: "localhost".to_string(),
            server_port: 8080,
            api_address: "api:10001".to_string(),
        }
    }

    #[test]
    fn default_ticket_is_derived_from_identity() {
        let env = Environment::host_default(
            identity("s"),
            endpoints(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(60),
        );
        assert_eq!(env.ticket(), "guestbook/default.v1.0");
        assert!(!env.is_request_specific());
        assert!(!env.skip_admin_check());
        assert!(!env.is_dev());
    }

    #[test]
    fn request_environment_inherits_identity_with_fresh_bookkeeping() {
        let default = Environment::host_default(
            identity("dev"),
            endpoints(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(60),
        );
        let _call = default.activity().api_call();

        let request = default.derive_for_request(
            Some("ticket-1".to_string()),
            RequestAttributes {
                request_id: "r1".to_string(),
                skip_admin_check: true,
                ..RequestAttributes::default()
            },
        );

        assert_eq!(request.identity(), default.identity());
        assert_eq!(request.ticket(), "ticket-1");
        assert!(request.is_dev());
        assert!(request.skip_admin_check());
        assert_eq!(request.activity().api_calls_in_flight(), 0);
        assert_eq!(default.activity().api_calls_in_flight(), 1);
    }

    #[test]
    fn missing_ticket_falls_back_to_default() {
        let default = Environment::host_default(
            identity("s"),
            endpoints(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(60),
        );
        let request = default.derive_for_request(None, RequestAttributes::default());
        assert_eq!(request.ticket(), default.ticket());
    }

    #[test]
    fn remaining_counts_down_from_long_timeout() {
        let clock = Arc::new(ManualClock::new(10_000));
        let default = Environment::host_default(
            identity("s"),
            endpoints(),
            clock.clone(),
            Duration::from_secs(10),
        );
        let request = default.derive_for_request(None, RequestAttributes::default());

        clock.advance(4_000);
        assert_eq!(request.remaining(), Duration::from_secs(6));

        clock.advance(60_000);
        assert_eq!(request.remaining(), Duration::ZERO);
    }
}
