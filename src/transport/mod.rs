//! Transport engines: protocol selection, executor provisioning and the
//! consumer / producer endpoints built on top of them.

pub mod binding;
pub mod client;
pub mod executor;
pub mod server;

pub use binding::TransportBinding;
pub use client::TransportClient;
pub use executor::{ExecutorProvider, PoolSizing, TokioExecutorProvider, WorkerPool};
pub use server::{processor_fn, MessageProcessor, TransportServer};
