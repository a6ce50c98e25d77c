//! Ordered, at-most-once cleanup registry.
//!
//! Modeled as an explicitly owned registry (rather than process-global
//! mutable state) that callers share via a handle, per the redesign
//! guidance to replace the singleton-with-global-state pattern while
//! keeping the same reverse-registration-order contract.

use std::sync::{Arc, Mutex};
use tracing::{error, info};

type Cleanup = Box<dyn FnOnce() + Send>;

struct Registry {
    callbacks: Vec<(String, Cleanup)>,
    shutdown_in_progress: bool,
    shutdown_complete: bool,
}

/// A cloneable handle to the shared cleanup registry. Cloning shares state;
/// it does not create a second registry.
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<Mutex<Registry>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        ShutdownManager {
            inner: Arc::new(Mutex::new(Registry {
                callbacks: Vec::new(),
                shutdown_in_progress: false,
                shutdown_complete: false,
            })),
        }
    }

    /// Registers a named cleanup. Cleanups run in reverse registration order
    /// (LIFO) so that dependencies created last are torn down first.
    pub fn register_cleanup<F>(&self, label: impl Into<String>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let label = label.into();
        let mut registry = self.inner.lock().unwrap();
        info!(label = label.as_str(), "registered cleanup");
        registry.callbacks.push((label, Box::new(callback)));
    }

    /// Runs every registered cleanup exactly once, in reverse order. Safe to
    /// call from multiple places (signal handler and normal exit path); a
    /// re-entrant or repeated call is a no-op.
    pub fn execute_shutdown(&self) {
        {
            let mut registry = self.inner.lock().unwrap();
            if registry.shutdown_complete || registry.shutdown_in_progress {
                return;
            }
            registry.shutdown_in_progress = true;
        }

        info!("executing shutdown sequence");
        let callbacks = {
            let mut registry = self.inner.lock().unwrap();
            std::mem::take(&mut registry.callbacks)
        };
        for (label, callback) in callbacks.into_iter().rev() {
            info!(label = label.as_str(), "running cleanup");
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
            if result.is_err() {
                error!(label = label.as_str(), "cleanup panicked");
            }
        }

        let mut registry = self.inner.lock().unwrap();
        registry.shutdown_complete = true;
        info!("shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().unwrap().shutdown_in_progress
    }

    /// Spawns a task that waits for SIGINT or SIGTERM and runs the shutdown
    /// sequence when either arrives.
    pub fn spawn_signal_listener(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            manager.execute_shutdown();
        })
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cleanups_run_in_reverse_registration_order() {
        let manager = ShutdownManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["sockets", "ramp_down"] {
            let order = order.clone();
            let label = label.to_string();
            manager.register_cleanup(label.clone(), move || order.lock().unwrap().push(label));
        }

        manager.execute_shutdown();
        assert_eq!(*order.lock().unwrap(), vec!["ramp_down", "sockets"]);
    }

    #[test]
    fn shutdown_runs_exactly_once() {
        let manager = ShutdownManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.register_cleanup("once", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.execute_shutdown();
        manager.execute_shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_cleanup_does_not_block_the_rest() {
        let manager = ShutdownManager::new();
        let calls = Arc::new(AtomicUsize::new(0));

        manager.register_cleanup("first", || panic!("boom"));
        let counter = calls.clone();
        manager.register_cleanup("second", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.execute_shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
