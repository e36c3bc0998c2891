use crate::error::{ConfigError, RelayError};
use crate::platform::{self, ConnectOptions};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A single backend endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Backend {
    host: String,
    port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    /// Parses `host:port`, `a.b.c.d:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidBackend(s.to_string());

        let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
            // IPv6 address in brackets
            let bracket_end = rest.find(']').ok_or_else(invalid)?;
            let host = &rest[..bracket_end];
            let port_str = rest[bracket_end + 1..].strip_prefix(':').ok_or_else(invalid)?;
            (host, port_str)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() || (host.contains(':') && !s.starts_with('[')) {
            return Err(invalid());
        }

        let port: u16 = port_str.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Backend::new(host, port))
    }
}

/// How a backend is chosen for an inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Uniform random choice, retrying the rest of the pool on connect failure
    #[default]
    Random,
    /// Client IP hashed onto the pool. Without `failover` an unreachable
    /// backend is not replaced, so a client never changes backend.
    SessionAffine { failover: bool },
}

/// Read-only backend pool plus the selection policy applied to it
#[derive(Debug, Clone)]
pub struct BackendSelector {
    backends: Arc<[Backend]>,
    policy: Policy,
}

impl BackendSelector {
    pub fn new(backends: Vec<Backend>, policy: Policy) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::EmptyPool);
        }

        Ok(Self {
            backends: backends.into(),
            policy,
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Session-affine choice for `client`. Pure function of the client IP.
    pub fn select(&self, client: IpAddr) -> &Backend {
        &self.backends[self.affine_index(client)]
    }

    fn affine_index(&self, client: IpAddr) -> usize {
        // A dual-stack listener reports IPv4 peers as ::ffff:a.b.c.d
        let mut hasher = DefaultHasher::new();
        client.to_canonical().hash(&mut hasher);
        (hasher.finish() % self.backends.len() as u64) as usize
    }

    /// Pick a backend for `client` according to the policy and open a
    /// connection to it.
    pub async fn connect(
        &self,
        client: IpAddr,
        options: &ConnectOptions,
    ) -> Result<(TcpStream, Backend), RelayError> {
        match self.policy {
            Policy::Random => self.connect_random(options).await,
            Policy::SessionAffine { failover: false } => {
                let backend = self.select(client);
                debug!(client = %client, backend = %backend, "Session-affine selection");
                match platform::connect(backend, options).await {
                    Ok(stream) => Ok((stream, backend.clone())),
                    Err(source) => {
                        warn!(backend = %backend, error = %source, "Affine backend unreachable");
                        Err(RelayError::Connect {
                            backend: backend.clone(),
                            source,
                        })
                    }
                }
            }
            Policy::SessionAffine { failover: true } => {
                let start = self.affine_index(client);
                let order = (0..self.backends.len()).map(|i| (start + i) % self.backends.len());
                self.connect_in_order(order, options).await
            }
        }
    }

    async fn connect_random(
        &self,
        options: &ConnectOptions,
    ) -> Result<(TcpStream, Backend), RelayError> {
        let mut remaining: Vec<usize> = (0..self.backends.len()).collect();
        let mut attempted = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let pick = rand::thread_rng().gen_range(0..remaining.len());
            let idx = remaining.swap_remove(pick);
            let backend = &self.backends[idx];
            attempted.push(backend.clone());

            match platform::connect(backend, options).await {
                Ok(stream) => {
                    info!(backend = %backend, idx, "Connected to backend");
                    return Ok((stream, backend.clone()));
                }
                Err(e) => {
                    warn!(backend = %backend, idx, error = %e, "Backend unreachable");
                }
            }
        }

        warn!("All backends failed");
        Err(RelayError::NoReachableBackend { attempted })
    }

    async fn connect_in_order(
        &self,
        order: impl Iterator<Item = usize>,
        options: &ConnectOptions,
    ) -> Result<(TcpStream, Backend), RelayError> {
        let mut attempted = Vec::with_capacity(self.backends.len());

        for idx in order {
            let backend = &self.backends[idx];
            attempted.push(backend.clone());

            match platform::connect(backend, options).await {
                Ok(stream) => {
                    info!(backend = %backend, idx, "Connected to backend");
                    return Ok((stream, backend.clone()));
                }
                Err(e) => {
                    warn!(backend = %backend, idx, error = %e, "Backend unreachable, failing over");
                }
            }
        }

        Err(RelayError::NoReachableBackend { attempted })
    }
}
