//! spray-relay: protocol-agnostic TCP relaying
//!
//! Two services share one relay core:
//! - a load balancing switch that spreads clients over a backend pool,
//!   randomly or with per-client-IP session affinity
//! - a monitor that forwards to one backend and records every connection
//!
//! Bytes are never interpreted; any stream protocol passes through as is.

pub mod config;
pub mod error;
pub mod load_balancer;
pub mod platform;
pub mod relay;
pub mod server;
pub mod stream;
pub mod watcher;

pub use error::{ConfigError, Direction, RelayError, ServerError};
pub use load_balancer::{Backend, BackendSelector, Policy};
pub use platform::ConnectOptions;
pub use relay::{relay, RelayOptions, Transfer};
pub use server::{RelayServer, ServerConfig};
pub use watcher::{ConnectionRecord, DirWatcher, LogWatcher, Watcher};
