//! Connection-oriented transport: bind, connect and socket options.

use std::io;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::adapters::resolve_addr;
use crate::config::TransportConfig;
use crate::error::TransportError;

const LISTEN_BACKLOG: u32 = 1024;

/// Bind the consumer-side listening socket with the configured options.
pub async fn bind(config: &TransportConfig) -> Result<TcpListener, TransportError> {
    let address = config.address();
    let addr = resolve_addr(&config.host, config.port)
        .await
        .map_err(|e| TransportError::bind_error(&address, e.to_string()))?;

    let bind_failed = |e: io::Error| TransportError::bind_error(&address, e.to_string());
    let socket = new_socket(addr.is_ipv4()).map_err(bind_failed)?;
    socket.set_reuseaddr(config.reuse_address).map_err(bind_failed)?;
    socket.bind(addr).map_err(bind_failed)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_failed)
}

/// Connect a producer-side socket, honoring the configured connect
/// timeout. The error carries the target address for context.
pub async fn connect(config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let address = config.address();
    let addr = resolve_addr(&config.host, config.port)
        .await
        .map_err(|e| TransportError::connect_error(&address, e.to_string()))?;

    let connect_failed = |e: io::Error| TransportError::connect_error(&address, e.to_string());
    let socket = new_socket(addr.is_ipv4()).map_err(connect_failed)?;
    socket.set_reuseaddr(config.reuse_address).map_err(connect_failed)?;

    let stream = tokio::time::timeout(config.connect_timeout(), socket.connect(addr))
        .await
        .map_err(|_| {
            TransportError::connect_error(
                &address,
                format!("connect timed out after {:?}", config.connect_timeout()),
            )
        })?
        .map_err(connect_failed)?;

    apply_stream_options(&stream, config).map_err(connect_failed)?;
    Ok(stream)
}

/// Per-stream options, applied to connected and accepted sockets alike.
pub fn apply_stream_options(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_no_delay)?;
    // tokio exposes no keepalive setter on the stream; go through socket2
    socket2::SockRef::from(stream).set_keepalive(config.keep_alive)?;
    Ok(())
}

fn new_socket(ipv4: bool) -> io::Result<TcpSocket> {
    if ipv4 {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}
