use crate::load_balancer::Backend;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Which way bytes were flowing when a relay direction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend
    Upstream,
    /// Backend to client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("client->backend"),
            Direction::Downstream => f.write_str("backend->client"),
        }
    }
}

/// Errors detected while building the service; all of them are fatal to startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid service port {0}")]
    InvalidPort(u32),

    #[error("Please specify one or more backends")]
    EmptyPool,

    #[error("Invalid backend address {0}")]
    InvalidBackend(String),

    #[error("Invalid connection limit {0}, must be at least 1")]
    InvalidConnectionLimit(usize),

    #[error("Invalid host {0}")]
    InvalidHost(String),

    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0}")]
    Missing(&'static str),
}

/// Errors local to one relay session. They never reach the acceptor loop.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to connect to backend {backend}: {source}")]
    Connect {
        backend: Backend,
        #[source]
        source: io::Error,
    },

    #[error("no reachable backend (tried {})", format_attempts(.attempted))]
    NoReachableBackend { attempted: Vec<Backend> },

    #[error("{direction} relay failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("relay aborted by shutdown")]
    Aborted,

    #[error("relay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn format_attempts(attempted: &[Backend]) -> String {
    attempted
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while starting a [`RelayServer`](crate::server::RelayServer)
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}
