//! `vmrt` core: request environments, in-flight bookkeeping, the environment
//! registry, and the trusted-address policy.

pub mod activity;
pub mod clock;
pub mod environment;
pub mod headers;
pub mod registry;
pub mod trust;

pub use activity::{ActivityTracker, InFlightCounter, InFlightGuard, WorkerGuard};
pub use clock::{Clock, ManualClock, SystemClock};
pub use environment::{
    Endpoints, Environment, EnvironmentIdentity, RequestAttributes, DEV_PARTITION,
};
pub use registry::{
    ActivationGuard, EnvironmentRegistry, RecordingRegistry, ThreadLocalRegistry,
};
pub use trust::{is_trusted, TrustedAddressChecker};

