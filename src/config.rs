//! Configuration for the server and the client driver.
//!
//! Both binaries are configured from the command line only; the parsed
//! arguments are resolved into plain config structs that the library
//! types consume.

use crate::runtime::{Protocol, DEFAULT_BACKLOG, DEFAULT_READ_SIZE};
use clap::{Parser, ValueEnum};
use std::net::{SocketAddr, ToSocketAddrs};
use tracing_subscriber::EnvFilter;

/// Default bind / connect target.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8888";

/// Default capacity of one poll batch.
pub const DEFAULT_EVENTS: usize = 1024;

/// Messages each client connection sends when none are given.
pub const DEFAULT_MESSAGES: [&str; 2] = ["Message 1", "Message 2"];

/// Request handler selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProtocolType {
    /// Fixed HTTP/1.0 hello-world response
    Hello,
    /// Echo every received byte
    Echo,
}

impl From<ProtocolType> for Protocol {
    fn from(protocol: ProtocolType) -> Self {
        match protocol {
            ProtocolType::Hello => Protocol::HelloWorld,
            ProtocolType::Echo => Protocol::Echo,
        }
    }
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "selector-server")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-multiplexed TCP server", long_about = None)]
pub struct ServerArgs {
    /// Address to bind to (e.g., 127.0.0.1:8888)
    #[arg(short = 'l', long, default_value = DEFAULT_ADDR)]
    pub listen: String,

    /// Maximum length of the pending connection queue
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: i32,

    /// Response produced for each request
    #[arg(short, long, value_enum, default_value_t = ProtocolType::Hello)]
    pub protocol: ProtocolType,

    /// Maximum bytes taken by a single receive
    #[arg(long, default_value_t = DEFAULT_READ_SIZE)]
    pub read_size: usize,

    /// Maximum readiness events handled per poll
    #[arg(long, default_value_t = DEFAULT_EVENTS)]
    pub events: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the client driver
#[derive(Parser, Debug)]
#[command(name = "selector-client")]
#[command(version = "0.1.0")]
#[command(about = "Opens several connections and sends each queued messages", long_about = None)]
pub struct ClientArgs {
    /// Server address (e.g., 127.0.0.1:8888)
    #[arg(short, long, default_value = DEFAULT_ADDR)]
    pub server: String,

    /// Number of connections to open
    #[arg(short = 'c', long, default_value_t = 1)]
    pub max_conns: usize,

    /// Message to send on every connection (repeatable, sent in order)
    #[arg(short, long = "message")]
    pub messages: Vec<String>,

    /// Close a connection once this many response bytes have arrived
    #[arg(long)]
    pub expect_bytes: Option<usize>,

    /// Maximum bytes taken by a single receive
    #[arg(long, default_value_t = DEFAULT_READ_SIZE)]
    pub read_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub protocol: Protocol,
    pub read_size: usize,
    pub events: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8888)),
            backlog: DEFAULT_BACKLOG,
            protocol: Protocol::HelloWorld,
            read_size: DEFAULT_READ_SIZE,
            events: DEFAULT_EVENTS,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from command-line arguments.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            listen: resolve(&args.listen)?,
            backlog: args.backlog.max(1),
            protocol: args.protocol.into(),
            read_size: args.read_size.max(1),
            events: args.events.max(1),
            log_level: args.log_level,
        })
    }
}

/// Resolved client driver configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub connections: usize,
    pub messages: Vec<String>,
    pub expect_bytes: Option<usize>,
    pub read_size: usize,
    pub events: usize,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 8888)),
            connections: 1,
            messages: DEFAULT_MESSAGES.iter().map(|m| m.to_string()).collect(),
            expect_bytes: None,
            read_size: DEFAULT_READ_SIZE,
            events: DEFAULT_EVENTS,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from command-line arguments.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(args: ClientArgs) -> Result<Self, ConfigError> {
        let messages = if args.messages.is_empty() {
            DEFAULT_MESSAGES.iter().map(|m| m.to_string()).collect()
        } else {
            args.messages
        };

        Ok(ClientConfig {
            server: resolve(&args.server)?,
            connections: args.max_conns.max(1),
            messages,
            expect_bytes: args.expect_bytes,
            read_size: args.read_size.max(1),
            events: DEFAULT_EVENTS,
            log_level: args.log_level,
        })
    }
}

/// Resolve `host:port` to the first matching socket address.
pub fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::Address(addr.to_string()))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Address(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Address(addr) => {
                write!(f, "Failed to resolve address '{}'", addr)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
