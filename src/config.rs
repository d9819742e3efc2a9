use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use std::path::Path;
use std::fs;
use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_POOLED_BUFFERS};
use crate::dispatcher::DispatcherOptions;
use crate::error::{ProxyError, Result};
use log::info;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// The Point to run
    #[serde(default)]
    pub point: PointConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

/// A listening port plus the inbound and outbound protocols behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port to listen on (0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,
    pub inbound: ConnectionConfig,
    pub outbound: ConnectionConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Protocol name plus its opaque settings blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

/// Buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity of every pooled buffer
    pub size: usize,
    /// Idle buffers kept for reuse
    pub pooled: usize,
}

/// Session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    pub udp_idle_timeout_secs: u64,
    pub udp_queue_depth: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    1080
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            inbound: ConnectionConfig::new("socks", None),
            outbound: ConnectionConfig::new("freedom", None),
            buffer: BufferConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_BUFFER_SIZE,
            pooled: DEFAULT_POOLED_BUFFERS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            udp_idle_timeout_secs: 60,
            udp_queue_depth: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn new(protocol: &str, settings: Option<Value>) -> Self {
        Self { protocol: protocol.to_string(), settings }
    }
}

impl SessionConfig {
    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            udp_idle_timeout: Duration::from_secs(self.udp_idle_timeout_secs),
            udp_queue_depth: self.udp_queue_depth,
        }
    }
}

impl PointConfig {
    pub fn new(port: u16, inbound: ConnectionConfig, outbound: ConnectionConfig) -> Self {
        Self { port, inbound, outbound, ..Self::default() }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Validate the point configuration
    pub fn validate(&self) -> Result<()> {
        if self.inbound.protocol.is_empty() || self.outbound.protocol.is_empty() {
            return Err(ProxyError::Config("protocol name must not be empty".to_string()));
        }

        if self.buffer.size == 0 {
            return Err(ProxyError::Config("buffer.size must be > 0".to_string()));
        }

        if self.session.connect_timeout_secs == 0 || self.session.udp_idle_timeout_secs == 0 {
            return Err(ProxyError::Config("session timeouts must be > 0".to_string()));
        }

        if self.session.udp_queue_depth == 0 {
            return Err(ProxyError::Config("session.udp_queue_depth must be > 0".to_string()));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!("Configuration loaded from file");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ProxyError::Config(format!("Invalid configuration: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => return Err(ProxyError::Config("Invalid log level".to_string())),
        }

        self.point.validate()
    }
}
