//! Protocol adapters: socket construction and option application per
//! transport kind.

pub mod local;
pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;

/// Resolve a configured host/port to the first matching socket address.
pub(crate) async fn resolve_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}:{}", host, port),
            )
        })
}
