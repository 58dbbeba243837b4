//! Listener socket setup shared by the proxy engines

use anyhow::Result;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// TCP keepalive interval. Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Delay before retrying after a failed accept
pub const ACCEPT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Bind a TCP listener with SO_REUSEADDR and the configured backlog
pub fn bind(address: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let socket_addr: SocketAddr = format!("{}:{}", address, port).parse()?;
    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Apply per-connection socket options to an accepted stream
pub fn tune_stream(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}
