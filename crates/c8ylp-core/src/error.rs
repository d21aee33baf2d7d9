use std::time::Duration;

use thiserror::Error;

/// Errors produced by the local proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("tenant id discovery failed: {0}")]
    TenantNotFound(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("remote access configuration not found: {0}")]
    ConfigurationNotFound(String),

    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error("local port in use: {0}")]
    PortInUse(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no traffic within {0:?}")]
    IdleTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Map a local bind error onto the dedicated kinds surfaced to the CLI.
    pub fn from_bind_error(err: std::io::Error, addr: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => ProxyError::PortInUse(addr.to_string()),
            std::io::ErrorKind::PermissionDenied => ProxyError::PermissionDenied(addr.to_string()),
            _ => ProxyError::Io(err),
        }
    }
}
