//! Executor-pool provisioning.
//!
//! The engines never build their own thread pools; they request named
//! pools from an [`ExecutorProvider`], scoped to the owning consumer or
//! producer so the pools can be torn down together at stop time.

use parking_lot::Mutex;

use crate::config::TransportConfig;
use crate::error::TransportError;

/// Requested pool dimensions.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizing {
    pub core: usize,
    pub max: usize,
    /// Fixed worker thread count, 0 = derive from `max`
    pub worker_count: usize,
}

impl PoolSizing {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            core: config.core_pool_size,
            max: config.max_pool_size,
            worker_count: 0,
        }
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Thread count for a fixed-size runtime: the explicit worker count
    /// when configured, the core pool size otherwise.
    pub fn threads(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            self.core.max(1)
        }
    }
}

/// Hands out ready-to-use worker pools on demand.
pub trait ExecutorProvider: Send + Sync {
    fn worker_pool(
        &self,
        owner: &str,
        name: &str,
        sizing: &PoolSizing,
    ) -> Result<WorkerPool, TransportError>;
}

/// A named pool of I/O threads.
///
/// Owned pools wrap a dedicated tokio runtime; borrowed pools only carry a
/// handle and release is a no-op for them.
pub struct WorkerPool {
    name: String,
    handle: tokio::runtime::Handle,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl WorkerPool {
    pub fn owned(name: impl Into<String>, runtime: tokio::runtime::Runtime) -> Self {
        Self {
            name: name.into(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        }
    }

    pub fn borrowed(name: impl Into<String>, handle: tokio::runtime::Handle) -> Self {
        Self {
            name: name.into(),
            handle,
            runtime: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Release the pool's threads. Uses a background shutdown so release
    /// is safe from inside an async context; outstanding tasks are
    /// abandoned, which is why the registry is drained first.
    pub fn release(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            tracing::debug!(pool = %self.name, "releasing worker pool");
            runtime.shutdown_background();
        }
    }
}

/// Pools may be dropped from async contexts (failed starts, selector
/// errors), where a plain runtime drop would panic; fall back to the
/// background shutdown.
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("owned", &self.runtime.lock().is_some())
            .finish()
    }
}

/// Default provider: one dedicated multi-thread tokio runtime per pool,
/// threads named after the owner and pool.
#[derive(Debug, Default)]
pub struct TokioExecutorProvider;

impl TokioExecutorProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutorProvider for TokioExecutorProvider {
    fn worker_pool(
        &self,
        owner: &str,
        name: &str,
        sizing: &PoolSizing,
    ) -> Result<WorkerPool, TransportError> {
        let pool_name = format!("{}-{}", owner, name);
        tracing::debug!(pool = %pool_name, threads = sizing.threads(), "provisioning worker pool");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(sizing.threads())
            .thread_name(pool_name.clone())
            .enable_all()
            .build()
            .map_err(|e| {
                TransportError::config_error(
                    "executor",
                    format!("cannot build worker pool '{}': {}", pool_name, e),
                )
            })?;
        Ok(WorkerPool::owned(pool_name, runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_worker_count_wins_over_pool_sizing() {
        let sizing = PoolSizing {
            core: 2,
            max: 8,
            worker_count: 0,
        };
        assert_eq!(sizing.threads(), 2);
        assert_eq!(sizing.with_worker_count(3).threads(), 3);
    }

    #[tokio::test]
    async fn provisioned_pool_runs_tasks_until_released() {
        let provider = TokioExecutorProvider::new();
        let sizing = PoolSizing {
            core: 1,
            max: 2,
            worker_count: 0,
        };
        let pool = provider.worker_pool("test", "worker", &sizing).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.spawn(async move {
            let _ = tx.send(42u32);
        });
        assert_eq!(rx.await.unwrap(), 42);

        pool.release();
        // releasing twice is a no-op
        pool.release();
    }
}
