//! Linux-specific outbound binding
//! Uses SO_BINDTODEVICE for true per-interface binding

use super::{finish_connect, ConnectOptions};
use nix::sys::socket::{setsockopt, sockopt::BindToDevice};
use socket2::{Domain, Protocol, Socket, Type};
use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::warn;

/// Connect to `target` from the configured source address and interface
pub(super) async fn connect_bound(target: SocketAddr, options: &ConnectOptions) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    // NOTE: Requires root or CAP_NET_RAW capability
    // sudo setcap cap_net_raw=eip ./spray-relay
    if let Some(ref iface) = options.interface {
        if let Err(e) = setsockopt(&socket, BindToDevice, &OsString::from(iface)) {
            warn!(interface = %iface, error = %e, "Couldn't bind to interface");
        }
    }

    if let Some(source) = options.source_address {
        socket.bind(&SocketAddr::new(source, 0).into())?;
    }

    finish_connect(socket, target).await
}
