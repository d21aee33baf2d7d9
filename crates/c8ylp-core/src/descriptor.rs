//! Connection descriptors shared between the resolver, the supervisor and
//! the bridges.
//!
//! A [`TunnelDescriptor`] is produced once by the resolver and then shared
//! read-only for the lifetime of the run. The bearer token it carries is
//! wrapped in [`SecretToken`] so it cannot end up in a log line by accident.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use url::Url;

/// A bearer token that redacts itself in `Debug` and `Display`.
///
/// The raw value is only reachable through [`SecretToken::expose`].
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

impl fmt::Display for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Everything needed to open one authenticated device tunnel.
///
/// Immutable after creation; shared by reference between the supervisor,
/// the acceptor and every bridge of a run.
#[derive(Debug, Clone)]
pub struct TunnelDescriptor {
    /// Normalized base URL of the Cumulocity host (scheme + authority).
    pub base_url: Url,
    /// Tenant id, discovered or supplied.
    pub tenant: String,
    /// Managed object id of the target device.
    pub device_id: String,
    /// Remote access configuration id (matched by name during resolve).
    pub config_id: String,
    /// Bearer token used for the REST calls and the WebSocket upgrade.
    pub token: SecretToken,
    /// Whether TLS peer verification is enabled.
    pub verify_tls: bool,
}

impl TunnelDescriptor {
    /// The WebSocket URL of the device tunnel.
    ///
    /// `https` bases map to `wss`, plain `http` bases to `ws`.
    pub fn tunnel_url(&self) -> Url {
        let mut url = self.base_url.clone();
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        // Both "ws" and "wss" are valid schemes, set_scheme cannot fail here.
        let _ = url.set_scheme(scheme);
        url.set_path(&format!(
            "/service/remoteaccess/client/{}/configurations/{}",
            self.device_id, self.config_id
        ));
        url
    }
}

/// Local TCP endpoint the acceptor binds.
///
/// A requested port of `0` asks the kernel for an ephemeral port; the
/// resolved port becomes observable once the listener is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub bind: IpAddr,
    pub port: u16,
}

impl LocalEndpoint {
    pub fn new(bind: IpAddr, port: u16) -> Self {
        Self { bind, port }
    }

    /// Loopback endpoint on the given port.
    pub fn loopback(port: u16) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for LocalEndpoint {
    fn default() -> Self {
        Self::loopback(0)
    }
}

/// How the acceptor treats its listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorMode {
    /// Accept exactly one connection, then drain and return.
    OneShot,
    /// Accept connections until cancelled, one active bridge at a time.
    Persistent,
}

/// The first event that ended a bridge. Sticky: later events never
/// overwrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    /// The local TCP peer closed its side.
    PeerClosedLocal,
    /// The gateway closed the WebSocket cleanly.
    PeerClosedRemote,
    /// I/O failure on the local TCP socket.
    ErrorLocal,
    /// Failure on the WebSocket transport.
    ErrorRemote,
    /// No bytes in either direction within the configured window.
    IdleTimeout,
    /// Supervisor- or user-initiated cancellation.
    Cancelled,
}

impl TerminalCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalCause::PeerClosedLocal => "peer-closed-local",
            TerminalCause::PeerClosedRemote => "peer-closed-remote",
            TerminalCause::ErrorLocal => "error-local",
            TerminalCause::ErrorRemote => "error-remote",
            TerminalCause::IdleTimeout => "timeout-idle",
            TerminalCause::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
