//! Outbound connection establishment
//!
//! Plain connects go through `TcpStream::connect`. When a source address or
//! an interface is configured the socket is built by hand with socket2 so it
//! can be bound before connecting.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(not(target_os = "linux"))]
mod generic;

use crate::load_balancer::Backend;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{trace, warn};

#[cfg(target_os = "linux")]
use linux::connect_bound;

#[cfg(not(target_os = "linux"))]
use generic::connect_bound;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How outbound backend connections are opened
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Upper bound for resolving and connecting to one backend
    pub timeout: Duration,
    /// Local address the outbound socket is bound to
    pub source_address: Option<IpAddr>,
    /// Network interface the outbound socket is bound to (Linux only)
    pub interface: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            source_address: None,
            interface: None,
        }
    }
}

impl ConnectOptions {
    fn is_bound(&self) -> bool {
        self.source_address.is_some() || self.interface.is_some()
    }
}

/// Connect to `backend`, giving up after `options.timeout`
pub async fn connect(backend: &Backend, options: &ConnectOptions) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(options.timeout, connect_any(backend, options))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", backend, options.timeout),
            )
        })??;

    if let Err(e) = stream.set_nodelay(true) {
        warn!(backend = %backend, error = %e, "Failed to set TCP_NODELAY");
    }

    Ok(stream)
}

/// Try every resolved address of `backend` in turn
async fn connect_any(backend: &Backend, options: &ConnectOptions) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in tokio::net::lookup_host((backend.host(), backend.port())).await? {
        if !family_matches(addr, options.source_address) {
            continue;
        }

        let result = if options.is_bound() {
            connect_bound(addr, options).await
        } else {
            TcpStream::connect(addr).await
        };

        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(addr = %addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("Could not resolve {backend} to a usable address"),
        )
    }))
}

fn family_matches(target: SocketAddr, source: Option<IpAddr>) -> bool {
    match source {
        Some(IpAddr::V4(_)) => target.is_ipv4(),
        Some(IpAddr::V6(_)) => target.is_ipv6(),
        None => true,
    }
}

/// Wait for a non-blocking connect started on `socket` to finish
async fn finish_connect(socket: socket2::Socket, target: SocketAddr) -> io::Result<TcpStream> {
    socket.set_nonblocking(true)?;

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    // Wait for connection to complete
    stream.writable().await?;

    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listening_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Backend::new("127.0.0.1", listener.local_addr().unwrap().port());

        let stream = connect(&backend, &ConnectOptions::default()).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn binds_to_source_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Backend::new("127.0.0.1", listener.local_addr().unwrap().port());
        let options = ConnectOptions {
            source_address: Some("127.0.0.1".parse().unwrap()),
            ..ConnectOptions::default()
        };

        let stream = connect(&backend, &options).await.unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), options.source_address.unwrap());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect(&Backend::new("127.0.0.1", port), &ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn family_mismatch_leaves_nothing_to_try() {
        let options = ConnectOptions {
            source_address: Some("::1".parse().unwrap()),
            ..ConnectOptions::default()
        };

        let err = connect(&Backend::new("127.0.0.1", 9), &options).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
