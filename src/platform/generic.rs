//! Generic (non-Linux) outbound binding
//! Uses source address binding without SO_BINDTODEVICE

use super::{finish_connect, ConnectOptions};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::warn;

/// Connect to `target` from the configured source address
pub(super) async fn connect_bound(target: SocketAddr, options: &ConnectOptions) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    if let Some(ref iface) = options.interface {
        warn!(interface = %iface, "Interface binding is only supported on Linux, ignoring");
    }

    if let Some(source) = options.source_address {
        socket.bind(&SocketAddr::new(source, 0).into())?;
    }

    finish_connect(socket, target).await
}
