//! Transport selection: map the configured protocol onto the executor
//! pools and delivery mechanism it needs.

use std::sync::Arc;

use crate::adapters::local::LocalHub;
use crate::config::{Protocol, TransportConfig};
use crate::error::TransportError;
use crate::transport::executor::{ExecutorProvider, PoolSizing, WorkerPool};

/// The per-protocol runtime resources of one consumer or producer.
///
/// TCP carries an accept ("boss") pool and an I/O ("worker") pool, UDP a
/// worker pool only, and the local transport nothing: its tasks run on the
/// caller's runtime and delivery stays in-process through the hub.
pub enum TransportBinding {
    Tcp { boss: WorkerPool, worker: WorkerPool },
    Udp { worker: WorkerPool },
    Local { hub: Arc<LocalHub> },
}

impl TransportBinding {
    /// Provision the resources for `config.protocol`, scoped to `owner` so
    /// they can be torn down together.
    pub fn select(
        config: &TransportConfig,
        provider: &dyn ExecutorProvider,
        owner: &str,
        hub: &Arc<LocalHub>,
    ) -> Result<Self, TransportError> {
        let sizing = PoolSizing::from_config(config);
        match config.protocol {
            Protocol::Tcp => Ok(TransportBinding::Tcp {
                boss: provider.worker_pool(owner, "tcp-boss", &sizing)?,
                worker: provider.worker_pool(
                    owner,
                    "tcp-worker",
                    &sizing.with_worker_count(config.worker_count),
                )?,
            }),
            Protocol::Udp => Ok(TransportBinding::Udp {
                worker: provider.worker_pool(owner, "udp-worker", &sizing)?,
            }),
            Protocol::Local => Ok(TransportBinding::Local { hub: hub.clone() }),
        }
    }

    pub fn hub(&self) -> Option<&Arc<LocalHub>> {
        match self {
            TransportBinding::Local { hub } => Some(hub),
            _ => None,
        }
    }

    /// Release the pools after the channel registry has been drained.
    pub fn release(&self) {
        match self {
            TransportBinding::Tcp { boss, worker } => {
                boss.release();
                worker.release();
            }
            TransportBinding::Udp { worker } => worker.release(),
            TransportBinding::Local { .. } => {}
        }
    }
}

impl std::fmt::Debug for TransportBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportBinding::Tcp { .. } => f.write_str("TransportBinding::Tcp"),
            TransportBinding::Udp { .. } => f.write_str("TransportBinding::Udp"),
            TransportBinding::Local { .. } => f.write_str("TransportBinding::Local"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::executor::TokioExecutorProvider;

    #[tokio::test]
    async fn tcp_gets_two_pools_and_udp_one() {
        let provider = TokioExecutorProvider::new();
        let hub = LocalHub::new();

        let tcp = TransportBinding::select(
            &TransportConfig::new(Protocol::Tcp),
            &provider,
            "test",
            &hub,
        )
        .unwrap();
        assert!(matches!(tcp, TransportBinding::Tcp { .. }));
        tcp.release();

        let udp = TransportBinding::select(
            &TransportConfig::new(Protocol::Udp),
            &provider,
            "test",
            &hub,
        )
        .unwrap();
        assert!(matches!(udp, TransportBinding::Udp { .. }));
        udp.release();

        let local = TransportBinding::select(
            &TransportConfig::new(Protocol::Local).with_local_address_name("svc"),
            &provider,
            "test",
            &hub,
        )
        .unwrap();
        assert!(local.hub().is_some());
        local.release();
    }
}
