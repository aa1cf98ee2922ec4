//! Async Bridge
//!
//! Owns the one tokio runtime a session uses and lets synchronous callers
//! drive futures on it to completion. The runtime is created on first use
//! and reused until `shutdown`.

use crate::error::BridgeError;
use crate::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Worker threads for transport I/O and telemetry delivery
const WORKER_THREADS: usize = 2;

/// Time allowed for in-flight tasks to stop during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct AsyncBridge {
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl AsyncBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the runtime has been created and not shut down
    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .map(|runtime| runtime.is_some())
            .unwrap_or(false)
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        let mut slot = self
            .runtime
            .lock()
            .map_err(|_| BridgeError::Runtime("Lock error".to_string()))?;

        if let Some(runtime) = slot.as_ref() {
            return Ok(runtime.clone());
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("wt9011-io")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Runtime(format!("Failed to create tokio runtime: {}", e)))?;
        info!("Async runtime started");

        let runtime = Arc::new(runtime);
        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    /// Block the calling thread until `future` completes.
    ///
    /// Fails instead of panicking when called from inside an async context,
    /// where blocking would stall the executor.
    pub fn run_blocking<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future,
    {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::Runtime(
                "blocking call made from within an async context".to_string(),
            ));
        }
        let runtime = self.runtime()?;
        Ok(runtime.block_on(future))
    }

    /// Start `future` on the runtime without waiting for it
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.runtime()?.spawn(future))
    }

    /// Stop the runtime. A later call starts a fresh one.
    pub fn shutdown(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(runtime) = runtime {
            match Arc::try_unwrap(runtime) {
                Ok(runtime) if Handle::try_current().is_ok() => runtime.shutdown_background(),
                Ok(runtime) => runtime.shutdown_timeout(SHUTDOWN_TIMEOUT),
                // A concurrent caller still holds it; it stops when they finish
                Err(_) => debug!("Runtime still in use, deferring shutdown"),
            }
            info!("Async runtime stopped");
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_created_lazily_and_reused() {
        let bridge = AsyncBridge::new();
        assert!(!bridge.is_running());

        let first = bridge.run_blocking(async { 41 + 1 }).unwrap();
        assert_eq!(first, 42);
        assert!(bridge.is_running());

        // A task spawned earlier is still alive on the same runtime
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
        let handle = bridge.spawn(async move { rx.await.unwrap_or(0) }).unwrap();
        tx.send(7).unwrap();
        let joined = bridge.run_blocking(handle).unwrap().unwrap();
        assert_eq!(joined, 7);
    }

    #[test]
    fn test_failure_propagates_as_value() {
        let bridge = AsyncBridge::new();
        let result: Result<std::result::Result<(), String>> =
            bridge.run_blocking(async { Err("refused".to_string()) });
        assert_eq!(result.unwrap(), Err("refused".to_string()));
    }

    #[test]
    fn test_nested_blocking_rejected() {
        let bridge = Arc::new(AsyncBridge::new());
        let inner = bridge.clone();
        let nested = bridge
            .run_blocking(async move { inner.run_blocking(async { 1 }).is_err() })
            .unwrap();
        assert!(nested);
    }

    #[test]
    fn test_shutdown_then_restart() {
        let bridge = AsyncBridge::new();
        bridge.run_blocking(async {}).unwrap();
        bridge.shutdown();
        assert!(!bridge.is_running());

        // Idempotent
        bridge.shutdown();

        assert_eq!(bridge.run_blocking(async { "again" }).unwrap(), "again");
        assert!(bridge.is_running());
    }

    #[test]
    fn test_sleep_uses_runtime_timer() {
        let bridge = AsyncBridge::new();
        let elapsed = bridge
            .run_blocking(async {
                let start = tokio::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(20)).await;
                start.elapsed()
            })
            .unwrap();
        assert!(elapsed >= Duration::from_millis(20));
    }
}
