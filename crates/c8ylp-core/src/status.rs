//! Terminal process status and exit-code mapping.

use crate::error::ProxyError;

/// The single terminal status a proxy run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok,
    GenericError,
    Usage,
    AuthFailed,
    DeviceNotFound,
    PortInUse,
    TunnelUnavailable,
    Cancelled,
}

impl ExitStatus {
    /// Process exit code for this status.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::GenericError => 1,
            ExitStatus::Usage => 2,
            ExitStatus::AuthFailed => 3,
            ExitStatus::DeviceNotFound => 4,
            ExitStatus::PortInUse => 5,
            ExitStatus::TunnelUnavailable => 6,
            ExitStatus::Cancelled => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Ok => "ok",
            ExitStatus::GenericError => "internal-error",
            ExitStatus::Usage => "usage",
            ExitStatus::AuthFailed => "auth-failed",
            ExitStatus::DeviceNotFound => "device-not-found",
            ExitStatus::PortInUse => "port-in-use",
            ExitStatus::TunnelUnavailable => "tunnel-unavailable",
            ExitStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ProxyError> for ExitStatus {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::Auth(_) | ProxyError::TenantNotFound(_) => ExitStatus::AuthFailed,
            ProxyError::DeviceNotFound(_) | ProxyError::ConfigurationNotFound(_) => {
                ExitStatus::DeviceNotFound
            }
            ProxyError::PortInUse(_) | ProxyError::PermissionDenied(_) => ExitStatus::PortInUse,
            ProxyError::TunnelUnavailable(_)
            | ProxyError::Transport(_)
            | ProxyError::Protocol(_) => ExitStatus::TunnelUnavailable,
            ProxyError::Cancelled => ExitStatus::Cancelled,
            ProxyError::InvalidConfig(_) => ExitStatus::Usage,
            ProxyError::IdleTimeout(_) => ExitStatus::Ok,
            ProxyError::Http(_) | ProxyError::Io(_) => ExitStatus::GenericError,
        }
    }
}
