//! Configuration for the spray-relay binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::load_balancer::{Backend, BackendSelector, Policy};
use crate::platform::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT};
use crate::relay::{RelayOptions, DEFAULT_CHUNK_SIZE};
use crate::server::ServerConfig;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "spray-relay")]
#[command(version)]
#[command(about = "A session-aware load balancing TCP switch and recording TCP monitor")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// The host to listen on
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Disable logs
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Timeout for connecting to one backend, in milliseconds
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,

    /// Bytes read per relay chunk
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Maximum number of connections handled at once
    #[arg(long, global = true)]
    pub max_connections: Option<usize>,

    /// Network interface outbound connections are bound to (Linux only)
    #[arg(long, global = true)]
    pub bind_interface: Option<String>,

    /// Local address outbound connections are bound to
    #[arg(long, global = true)]
    pub source_address: Option<String>,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Spread connections over a pool of backends
    Switch {
        /// The service port
        #[arg(short, long)]
        port: Option<u32>,

        /// Always route a client IP to the same backend
        #[arg(short, long)]
        session_aware: bool,

        /// Let session-aware routing fall back to another backend when the
        /// client's own backend is unreachable
        #[arg(long)]
        failover: bool,

        /// Backend addresses (host:port)
        backends: Vec<String>,
    },
    /// Forward to one backend and record every connection
    Monitor {
        /// The service port
        #[arg(short, long)]
        port: Option<u32>,

        /// Backend address (host:port)
        #[arg(short, long)]
        forward: Option<String>,

        /// Directory recorded connections are written to
        #[arg(short = 'd', long)]
        context_dir: Option<PathBuf>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub switch: SwitchSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub chunk_size: Option<usize>,
    pub max_connections: Option<usize>,
    pub bind_interface: Option<String>,
    pub source_address: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SwitchSection {
    #[serde(default)]
    pub session_aware: bool,
    #[serde(default)]
    pub failover: bool,
    #[serde(default)]
    pub backends: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct MonitorSection {
    pub forward: Option<String>,
    pub context_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process runs as
#[derive(Debug, Clone)]
pub enum Mode {
    Switch { backends: Vec<Backend>, policy: Policy },
    Monitor { forward: Backend, context_dir: Option<PathBuf> },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub mode: Mode,
    pub log_level: String,
    pub quiet: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let host_str = cli.host.or(file.server.host).unwrap_or_else(default_host);
        let host: IpAddr = parse_ip(&host_str).ok_or(ConfigError::InvalidHost(host_str))?;

        let source_address = match cli.source_address.or(file.server.source_address) {
            Some(s) => Some(parse_ip(&s).ok_or(ConfigError::InvalidHost(s))?),
            None => None,
        };

        let connect = ConnectOptions {
            timeout: cli
                .connect_timeout_ms
                .or(file.server.connect_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            source_address,
            interface: cli.bind_interface.or(file.server.bind_interface),
        };

        let chunk_size = cli
            .chunk_size
            .or(file.server.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);

        let (port, mode) = match cli.mode {
            ModeArgs::Switch {
                port,
                session_aware,
                failover,
                backends,
            } => {
                let backends = if backends.is_empty() {
                    file.switch.backends
                } else {
                    backends
                };
                let backends = backends
                    .iter()
                    .map(|b| b.parse())
                    .collect::<Result<Vec<Backend>, _>>()?;
                if backends.is_empty() {
                    return Err(ConfigError::EmptyPool);
                }

                let policy = if session_aware || file.switch.session_aware {
                    Policy::SessionAffine {
                        failover: failover || file.switch.failover,
                    }
                } else {
                    Policy::Random
                };

                (port, Mode::Switch { backends, policy })
            }
            ModeArgs::Monitor {
                port,
                forward,
                context_dir,
            } => {
                let forward = forward
                    .or(file.monitor.forward)
                    .ok_or(ConfigError::Missing("A forward address is required (--forward or [monitor].forward)"))?
                    .parse()?;

                (
                    port,
                    Mode::Monitor {
                        forward,
                        context_dir: context_dir.or(file.monitor.context_dir),
                    },
                )
            }
        };

        let port = port
            .or(file.server.port)
            .ok_or(ConfigError::Missing("A service port is required (--port or [server].port)"))?;

        let record = matches!(mode, Mode::Monitor { .. });

        let max_connections = match cli.max_connections.or(file.server.max_connections) {
            Some(n) => Some(NonZeroUsize::new(n).ok_or(ConfigError::InvalidConnectionLimit(n))?),
            None => None,
        };

        Ok(Config {
            server: ServerConfig {
                host,
                port: validate_port(port)?,
                connect,
                relay: RelayOptions { chunk_size, record },
                max_connections,
            },
            mode,
            log_level: cli.log_level.unwrap_or(file.logging.level),
            quiet: cli.quiet,
        })
    }

    /// Backend pool and policy for this mode
    pub fn selector(&self) -> Result<BackendSelector, ConfigError> {
        match &self.mode {
            Mode::Switch { backends, policy } => BackendSelector::new(backends.clone(), *policy),
            Mode::Monitor { forward, .. } => BackendSelector::new(vec![forward.clone()], Policy::Random),
        }
    }
}

/// Service ports must be in 1..=65535
pub fn validate_port(port: u32) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(port)),
    }
}

/// Parse an IP address that may be in bracket notation for IPv6
fn parse_ip(s: &str) -> Option<IpAddr> {
    match s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Some(inner) => inner.parse().ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("spray-relay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_port_range() {
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert!(matches!(validate_port(0), Err(ConfigError::InvalidPort(0))));
        assert!(matches!(validate_port(65536), Err(ConfigError::InvalidPort(65536))));
    }

    #[test]
    fn test_switch_from_cli() {
        let config = Config::merge(
            cli(&["switch", "-p", "8080", "-s", "10.0.0.1:80", "[::1]:81"]),
            TomlConfig::default(),
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, IpAddr::from([0, 0, 0, 0]));
        assert!(!config.server.relay.record);
        match config.mode {
            Mode::Switch { backends, policy } => {
                assert_eq!(backends, vec![Backend::new("10.0.0.1", 80), Backend::new("::1", 81)]);
                assert_eq!(policy, Policy::SessionAffine { failover: false });
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_switch_needs_backends() {
        let err = Config::merge(cli(&["switch", "-p", "8080"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPool));
    }

    #[test]
    fn test_monitor_records() {
        let config = Config::merge(
            cli(&["monitor", "--port", "9000", "--forward", "example.com:80", "-d", "/tmp/ctx"]),
            TomlConfig::default(),
        )
        .unwrap();

        assert!(config.server.relay.record);
        assert_eq!(config.selector().unwrap().backends(), &[Backend::new("example.com", 80)]);
        match config.mode {
            Mode::Monitor { context_dir, .. } => assert_eq!(context_dir, Some(PathBuf::from("/tmp/ctx"))),
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let err = Config::merge(cli(&["switch", "-p", "70000", "a:1"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(70000)));
    }

    #[test]
    fn test_zero_connection_limit_is_rejected() {
        let err = Config::merge(
            cli(&["--max-connections", "0", "switch", "-p", "8080", "a:1"]),
            TomlConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConnectionLimit(0)));

        let file: TomlConfig = toml::from_str("[server]\nmax_connections = 0\n").unwrap();
        let err = Config::merge(cli(&["switch", "-p", "8080", "a:1"]), file).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConnectionLimit(0)));

        let config = Config::merge(cli(&["switch", "-p", "8080", "a:1"]), TomlConfig::default()).unwrap();
        assert!(config.server.max_connections.is_none());
    }

    #[test]
    fn test_toml_parsing_and_precedence() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            connect_timeout_ms = 250
            max_connections = 64

            [switch]
            session_aware = true
            failover = true
            backends = ["10.0.0.1:80", "10.0.0.2:80"]

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(&["switch", "--port", "7001"]), file).unwrap();

        assert_eq!(config.server.port, 7001);
        assert_eq!(config.server.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.server.connect.timeout, Duration::from_millis(250));
        assert_eq!(config.server.max_connections, NonZeroUsize::new(64));
        assert_eq!(config.log_level, "debug");
        match config.mode {
            Mode::Switch { backends, policy } => {
                assert_eq!(backends.len(), 2);
                assert_eq!(policy, Policy::SessionAffine { failover: true });
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_default_toml() {
        let config = TomlConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(config.switch.backends.is_empty());
        assert!(config.server.port.is_none());
    }
}
