//! Connectionless transport.
//!
//! Sockets are built with socket2 because tokio's `UdpSocket` exposes no
//! buffer-size options. Producer sockets are always bound to an ephemeral
//! local endpoint before `connect`; skipping that bind fails silently on
//! some stacks, so it is a portability requirement, not an optimization.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::adapters::resolve_addr;
use crate::config::TransportConfig;
use crate::error::TransportError;

fn make_socket(ipv4: bool, config: &TransportConfig) -> io::Result<Socket> {
    let domain = if ipv4 { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(config.reuse_address)?;
    socket.set_broadcast(config.broadcast)?;
    if config.send_buffer_size > 0 {
        socket.set_send_buffer_size(config.send_buffer_size)?;
    }
    if config.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(config.receive_buffer_size)?;
    }
    Ok(socket)
}

/// Bind the consumer-side datagram socket with the configured options.
pub async fn bind(config: &TransportConfig) -> Result<UdpSocket, TransportError> {
    let address = config.address();
    let addr = resolve_addr(&config.host, config.port)
        .await
        .map_err(|e| TransportError::bind_error(&address, e.to_string()))?;

    let bind_failed = |e: io::Error| TransportError::bind_error(&address, e.to_string());
    let socket = make_socket(addr.is_ipv4(), config).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    UdpSocket::from_std(socket.into()).map_err(bind_failed)
}

/// Producer-side socket: bind an ephemeral local endpoint, then connect to
/// the remote address.
pub async fn connect(config: &TransportConfig) -> Result<UdpSocket, TransportError> {
    let address = config.address();
    let remote = resolve_addr(&config.host, config.port)
        .await
        .map_err(|e| TransportError::connect_error(&address, e.to_string()))?;

    let connect_failed = |e: io::Error| TransportError::connect_error(&address, e.to_string());
    let local = if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };

    let socket = make_socket(remote.is_ipv4(), config).map_err(connect_failed)?;
    socket.bind(&local.into()).map_err(connect_failed)?;
    let socket = UdpSocket::from_std(socket.into()).map_err(connect_failed)?;
    socket.connect(remote).await.map_err(connect_failed)?;
    Ok(socket)
}

/// Receive-buffer length for one datagram read: the fixed predictor when
/// configured, a page-sized default otherwise.
pub fn read_buffer_len(config: &TransportConfig) -> usize {
    if config.receive_buffer_size_predictor > 0 {
        config.receive_buffer_size_predictor
    } else {
        2048
    }
}
