//! Process-wide record of the environment active on the calling thread.
//!
//! Exactly one environment is active per thread at a time. Outside any
//! request that is the host default. The registry is a trait so hosts can
//! inject a deterministic fake in tests; [`ThreadLocalRegistry`] is the
//! production implementation.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::environment::Environment;

/// Tracks the active [`Environment`] for the calling thread.
pub trait EnvironmentRegistry: Send + Sync + fmt::Debug {
    /// Makes `env` active for the calling thread, overwriting any previous
    /// value. Returns the environment that was explicitly active before, if any.
    fn activate(&self, env: Arc<Environment>) -> Option<Arc<Environment>>;

    /// Restores the host default for the calling thread.
    fn deactivate(&self);

    /// The environment active for the calling thread, or the default.
    fn current(&self) -> Arc<Environment>;

    /// The host default environment.
    fn default_environment(&self) -> Arc<Environment>;
}

thread_local! {
    static ACTIVE: RefCell<Option<Arc<Environment>>> = const { RefCell::new(None) };
}

/// Registry backed by a thread-local slot.
///
/// The slot is process-wide, so a process should run a single
/// `ThreadLocalRegistry`.
#[derive(Debug)]
pub struct ThreadLocalRegistry {
    default: Arc<Environment>,
}

impl ThreadLocalRegistry {
    #[must_use]
    pub fn new(default: Arc<Environment>) -> Self {
        Self { default }
    }
}

impl EnvironmentRegistry for ThreadLocalRegistry {
    fn activate(&self, env: Arc<Environment>) -> Option<Arc<Environment>> {
        ACTIVE.with(|slot| slot.replace(Some(env)))
    }

    fn deactivate(&self) {
        ACTIVE.with(|slot| slot.borrow_mut().take());
    }

    fn current(&self) -> Arc<Environment> {
        ACTIVE.with(|slot| {
            slot.borrow()
                .as_ref()
                .map_or_else(|| Arc::clone(&self.default), Arc::clone)
        })
    }

    fn default_environment(&self) -> Arc<Environment> {
        Arc::clone(&self.default)
    }
}

/// Deterministic single-slot registry that counts activations.
///
/// Ignores thread identity entirely, which makes balance assertions in tests
/// independent of the scheduler.
#[derive(Debug)]
pub struct RecordingRegistry {
    default: Arc<Environment>,
    active: Mutex<Option<Arc<Environment>>>,
    activations: AtomicU64,
    deactivations: AtomicU64,
}

impl RecordingRegistry {
    #[must_use]
    pub fn new(default: Arc<Environment>) -> Self {
        Self {
            default,
            active: Mutex::new(None),
            activations: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deactivations(&self) -> u64 {
        self.deactivations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_default_active(&self) -> bool {
        self.active.lock().is_none()
    }
}

impl EnvironmentRegistry for RecordingRegistry {
    fn activate(&self, env: Arc<Environment>) -> Option<Arc<Environment>> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.active.lock().replace(env)
    }

    fn deactivate(&self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        self.active.lock().take();
    }

    fn current(&self) -> Arc<Environment> {
        self.active
            .lock()
            .as_ref()
            .map_or_else(|| Arc::clone(&self.default), Arc::clone)
    }

    fn default_environment(&self) -> Arc<Environment> {
        Arc::clone(&self.default)
    }
}

/// Activation scoped to the current thread.
///
/// Dropping the guard restores whatever was active before: the previous
/// environment when activations nest, otherwise the default. The guard is
/// `!Send` because the registry slot belongs to the thread that created it.
#[must_use = "the environment is deactivated as soon as the guard is dropped"]
pub struct ActivationGuard {
    registry: Arc<dyn EnvironmentRegistry>,
    previous: Option<Arc<Environment>>,
    _thread_bound: PhantomData<*const ()>,
}

impl ActivationGuard {
    /// Activates `env` on `registry` for the calling thread.
    pub fn activate(registry: &Arc<dyn EnvironmentRegistry>, env: Arc<Environment>) -> Self {
        let previous = registry.activate(env);
        Self {
            registry: Arc::clone(registry),
            previous,
            _thread_bound: PhantomData,
        }
    }
}

impl fmt::Debug for ActivationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationGuard")
            .field("nested", &self.previous.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(previous) => {
                self.registry.activate(previous);
            }
            None => self.registry.deactivate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::environment::{Endpoints, EnvironmentIdentity, RequestAttributes};

    fn default_env() -> Arc<Environment> {
        Arc::new(Environment::host_default(
            EnvironmentIdentity {
                app_id: "app".to_string(),
                partition: "s".to_string(),
                module: "default".to_string(),
                version: "v1".to_string(),
                instance: "0".to_string(),
            },
            Endpoints {
                server_host: "localhost".to_string(),
                server_port: 8080,
                api_address: "api:10001".to_string(),
            },
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(60),
        ))
    }

    fn request_env(default: &Environment, id: &str) -> Arc<Environment> {
        Arc::new(default.derive_for_request(
            None,
            RequestAttributes {
                request_id: id.to_string(),
                ..RequestAttributes::default()
            },
        ))
    }

    #[test]
    fn current_is_default_until_activated() {
        let default = default_env();
        let registry = ThreadLocalRegistry::new(Arc::clone(&default));
        assert!(Arc::ptr_eq(&registry.current(), &default));

        let env = request_env(&default, "r1");
        assert!(registry.activate(Arc::clone(&env)).is_none());
        assert!(Arc::ptr_eq(&registry.current(), &env));

        registry.deactivate();
        assert!(Arc::ptr_eq(&registry.current(), &default));
    }

    #[test]
    fn activation_is_per_thread() {
        let default = default_env();
        let registry = Arc::new(ThreadLocalRegistry::new(Arc::clone(&default)));
        let env = request_env(&default, "r1");
        registry.activate(env);

        let other = Arc::clone(&registry);
        let seen_default = std::thread::spawn(move || {
            Arc::ptr_eq(&other.current(), &other.default_environment())
        })
        .join()
        .unwrap();
        assert!(seen_default);

        registry.deactivate();
    }

    #[test]
    fn guard_restores_default_on_drop() {
        let default = default_env();
        let registry: Arc<dyn EnvironmentRegistry> =
            Arc::new(RecordingRegistry::new(Arc::clone(&default)));
        let env = request_env(&default, "r1");

        {
            let _guard = ActivationGuard::activate(&registry, Arc::clone(&env));
            assert!(Arc::ptr_eq(&registry.current(), &env));
        }
        assert!(Arc::ptr_eq(&registry.current(), &default));
    }

    #[test]
    fn nested_guards_restore_outer_environment() {
        let default = default_env();
        let registry: Arc<dyn EnvironmentRegistry> =
            Arc::new(ThreadLocalRegistry::new(Arc::clone(&default)));
        let outer = request_env(&default, "outer");
        let inner = request_env(&default, "inner");

        let outer_guard = ActivationGuard::activate(&registry, Arc::clone(&outer));
        {
            let _inner_guard = ActivationGuard::activate(&registry, Arc::clone(&inner));
            assert!(Arc::ptr_eq(&registry.current(), &inner));
        }
        assert!(Arc::ptr_eq(&registry.current(), &outer));
        drop(outer_guard);
        assert!(Arc::ptr_eq(&registry.current(), &default));
    }

    #[test]
    fn guard_deactivates_during_unwind() {
        let default = default_env();
        let recording = Arc::new(RecordingRegistry::new(Arc::clone(&default)));
        let registry: Arc<dyn EnvironmentRegistry> = recording.clone();
        let env = request_env(&default, "r1");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ActivationGuard::activate(&registry, env);
            panic!("handler failed");
        }));

        assert!(result.is_err());
        assert_eq!(recording.activations(), 1);
        assert_eq!(recording.deactivations(), 1);
        assert!(recording.is_default_active());
    }
}
