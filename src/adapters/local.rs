//! In-process virtual transport.
//!
//! A [`LocalHub`] maps virtual address names to acceptor queues. Connecting
//! creates a paired in-memory duplex stream, so local channels run the same
//! stream I/O loop as TCP without sockets or executor pools; delivery stays
//! on the caller's runtime.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// In-memory buffer per direction of a local channel.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Pending-accept queue depth per virtual address.
const ACCEPT_BACKLOG: usize = 16;

/// Virtual-address namespace for the local protocol.
///
/// Consumers bind a name, producers connect to it. Engines take the hub as
/// an explicit constructor argument; [`LocalHub::global`] exists for the
/// common case of one namespace per process.
pub struct LocalHub {
    listeners: Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide hub shared by endpoints that do not supply their
    /// own.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<LocalHub>> = OnceLock::new();
        GLOBAL.get_or_init(LocalHub::new).clone()
    }

    /// Claim a virtual address and return its acceptor queue.
    pub fn bind(&self, name: &str) -> Result<mpsc::Receiver<DuplexStream>, TransportError> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(name) {
            return Err(TransportError::bind_error(
                format!("local:{}", name),
                "virtual address is already bound",
            ));
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(name.to_string(), tx);
        tracing::debug!(address = name, "bound virtual address");
        Ok(rx)
    }

    /// Release a virtual address. Unknown names are ignored.
    pub fn unbind(&self, name: &str) {
        if self.listeners.lock().remove(name).is_some() {
            tracing::debug!(address = name, "unbound virtual address");
        }
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.listeners.lock().contains_key(name)
    }

    /// Connect to a bound virtual address, handing the listener its end of
    /// a fresh duplex pair.
    pub async fn connect(&self, name: &str) -> Result<DuplexStream, TransportError> {
        let acceptor = self.listeners.lock().get(name).cloned().ok_or_else(|| {
            TransportError::connect_error(
                format!("local:{}", name),
                "no listener on virtual address",
            )
        })?;

        let (client_end, server_end) = tokio::io::duplex(DUPLEX_BUFFER);
        acceptor.send(server_end).await.map_err(|_| {
            TransportError::connect_error(
                format!("local:{}", name),
                "listener is shutting down",
            )
        })?;
        Ok(client_end)
    }
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("bound", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_connect_and_exchange_bytes() {
        let hub = LocalHub::new();
        let mut acceptor = hub.bind("svc").unwrap();

        let mut client = hub.connect("svc").await.unwrap();
        let mut server = acceptor.recv().await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let hub = LocalHub::new();
        let _rx = hub.bind("svc").unwrap();
        let err = hub.bind("svc").unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let hub = LocalHub::new();
        let err = hub.connect("nobody").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn unbind_frees_the_address() {
        let hub = LocalHub::new();
        let _rx = hub.bind("svc").unwrap();
        hub.unbind("svc");
        assert!(!hub.is_bound("svc"));
        let _rx = hub.bind("svc").unwrap();
    }
}
