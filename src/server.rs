//! Relay server: listening socket, accept loop and per-connection sessions.

use crate::error::{RelayError, ServerError};
use crate::load_balancer::{Backend, BackendSelector};
use crate::platform::ConnectOptions;
use crate::relay::{relay, RelayOptions, Transfer};
use crate::watcher::{ConnectionRecord, Watcher};
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub host: IpAddr,
    /// Service port; 0 lets the OS pick one
    pub port: u16,
    pub connect: ConnectOptions,
    pub relay: RelayOptions,
    /// Cap on concurrently handled connections; unbounded when `None`
    pub max_connections: Option<NonZeroUsize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            connect: ConnectOptions::default(),
            relay: RelayOptions::default(),
            max_connections: None,
        }
    }
}

/// Shared, read-only state every session task needs
struct SessionContext {
    selector: BackendSelector,
    watcher: Option<Arc<dyn Watcher>>,
    connect: ConnectOptions,
    relay: RelayOptions,
    abort: CancellationToken,
}

/// A running switch or monitor.
///
/// Dropping the server stops the accept loop; sessions already in flight
/// keep running until their peers close or [`RelayServer::abort`] is called.
pub struct RelayServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Bind the listening socket and start accepting.
    ///
    /// Fails if the port is already in use.
    pub async fn bind(
        config: ServerConfig,
        selector: BackendSelector,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Self, ServerError> {
        let bind_addr = SocketAddr::new(config.host, config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

        info!(
            addr = %local_addr,
            backends = selector.len(),
            policy = ?selector.policy(),
            recording = config.relay.record,
            "Relay server started"
        );
        for (idx, backend) in selector.backends().iter().enumerate() {
            info!("Backend {}: {}", idx + 1, backend);
        }

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let tracker = TaskTracker::new();

        let context = Arc::new(SessionContext {
            selector,
            watcher,
            connect: config.connect,
            relay: config.relay,
            abort: abort.clone(),
        });

        let acceptor = tokio::spawn(accept_loop(
            listener,
            context,
            config.max_connections.map(|n| Arc::new(Semaphore::new(n.get()))),
            tracker.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            abort,
            tracker,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sessions still running
    pub fn active_sessions(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting. The port is released by the time this returns.
    /// Sessions in flight keep draining. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tracker.close();

        let acceptor = self.acceptor.lock().await.take();
        if let Some(handle) = acceptor {
            if let Err(e) = handle.await {
                warn!(error = %e, "Acceptor task failed");
            }
            info!(addr = %self.local_addr, "Relay server closed");
        }
    }

    /// Force every in-flight session to stop and close its sockets
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Wait until the server is closed and every session has finished
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.tracker.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<SessionContext>,
    limit: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let mut next_id: u64 = 0;

    loop {
        let permit = match &limit {
            Some(limit) => {
                let acquired = tokio::select! {
                    p = limit.clone().acquire_owned() => p,
                    _ = shutdown.cancelled() => break,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                }
            }
            None => None,
        };

        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = shutdown.cancelled() => break,
        };

        match accepted {
            Ok((socket, peer)) => {
                next_id += 1;
                debug!(id = next_id, peer = %peer, "New connection");
                tracker.spawn(handle_session(Arc::clone(&context), next_id, socket, peer, permit));
            }
            Err(e) => {
                warn!(error = %e, "Could not accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop stopped");
}

/// One inbound connection from accept to close. The inbound socket is owned
/// here and dropped on every path out.
async fn handle_session(
    context: Arc<SessionContext>,
    id: u64,
    inbound: TcpStream,
    peer: SocketAddr,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let opened = Utc::now();

    if let Err(e) = inbound.set_nodelay(true) {
        debug!(id, peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    match run_session(&context, inbound, peer).await {
        Ok((backend, mut transfer)) => {
            let failure = transfer.error.take();
            match &failure {
                None => info!(
                    id,
                    peer = %peer,
                    backend = %backend,
                    upstream_bytes = transfer.upstream,
                    downstream_bytes = transfer.downstream,
                    "Session closed"
                ),
                Some(e) => warn!(
                    id,
                    peer = %peer,
                    backend = %backend,
                    upstream_bytes = transfer.upstream,
                    downstream_bytes = transfer.downstream,
                    error = %e,
                    "Session cut short"
                ),
            }

            // Whatever was relayed before a failure is still recorded
            if let Some(watcher) = &context.watcher {
                watcher.record_created(ConnectionRecord::new(
                    id,
                    peer,
                    backend,
                    opened,
                    Utc::now(),
                    transfer.request.unwrap_or_default(),
                    transfer.response.unwrap_or_default(),
                ));
                if let Some(e) = &failure {
                    watcher.exception_caught(e);
                }
            }
        }
        Err(e) => {
            warn!(id, peer = %peer, error = %e, "Session failed");
            if let Some(watcher) = &context.watcher {
                watcher.exception_caught(&e);
            }
        }
    }
}

/// Connect to a backend and relay. Only a failure to reach a backend is an
/// `Err`; a relay that breaks off reports it in [`Transfer::error`].
async fn run_session(
    context: &SessionContext,
    inbound: TcpStream,
    peer: SocketAddr,
) -> Result<(Backend, Transfer), RelayError> {
    let (outbound, backend) = tokio::select! {
        r = context.selector.connect(peer.ip(), &context.connect) => r?,
        _ = context.abort.cancelled() => return Err(RelayError::Aborted),
    };

    info!(peer = %peer, backend = %backend, "Tunnelled");
    let transfer = relay(inbound, outbound, &context.relay, &context.abort).await;
    Ok((backend, transfer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::Policy;

    fn loopback() -> ServerConfig {
        ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        }
    }

    fn selector() -> BackendSelector {
        BackendSelector::new(vec![Backend::new("127.0.0.1", 9)], Policy::Random).unwrap()
    }

    #[tokio::test]
    async fn bind_fails_when_port_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..loopback()
        };

        let err = RelayServer::bind(config, selector(), None).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_port() {
        let server = RelayServer::bind(loopback(), selector(), None).await.unwrap();
        let addr = server.local_addr();

        server.close().await;
        server.close().await;
        server.wait().await;

        assert!(TcpStream::connect(addr).await.is_err());
        // The port can be bound again
        let _again = TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn unroutable_client_is_closed_without_a_reply() {
        use tokio::io::AsyncReadExt;

        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = dead.local_addr().unwrap().port();
        drop(dead);
        let selector = BackendSelector::new(vec![Backend::new("127.0.0.1", port)], Policy::Random).unwrap();

        let server = RelayServer::bind(loopback(), selector, None).await.unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        server.close().await;
        server.wait().await;
        assert_eq!(server.active_sessions(), 0);
    }
}
