//! msgport - bidirectional message transport adapter
//!
//! One configuration surface and one exchange contract over three
//! transports: TCP, UDP and an in-process virtual transport. Channels carry
//! pluggable codec pipelines, every live channel is tracked for graceful
//! shutdown, and producers optionally correlate a reply back to each
//! dispatched exchange.

// transport engines
pub mod transport;

// protocol adapters
pub mod adapters;

// core types
pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod pipeline;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};

/// Type-safe channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Next process-unique channel id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChannelId> for u64 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

// re-export the core types
pub use adapters::local::LocalHub;
pub use channel::Channel;
pub use config::{NoReplyLogLevel, Protocol, TextlineDelimiter, TransportConfig};
pub use error::TransportError;
pub use exchange::{completion_pair, DoneCallback, Exchange, ExchangeRef, Payload};
pub use pipeline::{
    Codec, ClientPipelineFactory, Pipeline, RawCodec, ServerPipelineFactory, TextlineCodec,
};
pub use registry::ChannelRegistry;
pub use transport::{
    processor_fn, ExecutorProvider, MessageProcessor, PoolSizing, TokioExecutorProvider,
    TransportClient, TransportServer, WorkerPool,
};

/// Convenient result alias.
pub type Result<T> = std::result::Result<T, TransportError>;
