use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Protocol already registered: {0}")]
    DuplicateProtocol(String),

    #[error("Dispatcher closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
