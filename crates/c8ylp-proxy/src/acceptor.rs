//! Local TCP acceptor.
//!
//! Binds the local endpoint, accepts connections and runs one bridge per
//! connection. The device-side protocol supports a single tunnel per
//! invocation, so exactly one bridge is active at a time; in persistent
//! mode the listening socket is reused serially for the next client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use c8ylp_core::{AcceptorMode, LocalEndpoint, ProxyError, ProxyResult, TunnelDescriptor};

use crate::bridge::{self, BridgeConfig, BridgeReport};

/// Acceptor before binding.
pub struct Acceptor {
    descriptor: Arc<TunnelDescriptor>,
    config: BridgeConfig,
    mode: AcceptorMode,
    cancel: CancellationToken,
}

impl Acceptor {
    pub fn new(
        descriptor: Arc<TunnelDescriptor>,
        config: BridgeConfig,
        mode: AcceptorMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            config,
            mode,
            cancel,
        }
    }

    /// Bind the local endpoint.
    ///
    /// No address reuse is requested: each run gets a fresh bind. With a
    /// requested port of 0 the kernel picks an ephemeral port, observable
    /// through [`BoundAcceptor::local_addr`] before any accept happens.
    pub async fn bind(self, endpoint: LocalEndpoint) -> ProxyResult<BoundAcceptor> {
        let addr = endpoint.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::from_bind_error(e, &addr.to_string()))?;
        let local_addr = listener.local_addr()?;

        Ok(BoundAcceptor {
            listener,
            local_addr,
            descriptor: self.descriptor,
            config: self.config,
            mode: self.mode,
            cancel: self.cancel,
        })
    }
}

/// Acceptor with a live listening socket.
pub struct BoundAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    descriptor: Arc<TunnelDescriptor>,
    config: BridgeConfig,
    mode: AcceptorMode,
    cancel: CancellationToken,
}

impl BoundAcceptor {
    /// The actually bound address; the port is kernel-assigned when the
    /// endpoint requested port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and bridge connections until done.
    ///
    /// Returns the report of the single session in one-shot mode, `None`
    /// when a persistent acceptor is cancelled. Bridge failures never end a
    /// persistent acceptor; bind-level accept errors that are not transient
    /// do.
    pub async fn run(self) -> ProxyResult<Option<BridgeReport>> {
        info!(addr = %self.local_addr, mode = ?self.mode, "listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("acceptor cancelled, draining");
                    return Ok(None);
                }
                result = self.listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "transient accept error, retrying");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        return Err(e.into());
                    }
                },
            };

            // Interactive protocols over the bridge care about latency.
            let _ = stream.set_nodelay(true);
            info!(peer = %peer, "connection accepted");

            let report =
                bridge::run(stream, self.descriptor.clone(), &self.config, &self.cancel).await;

            info!(
                peer = %peer,
                cause = %report.cause,
                bytes_up = report.bytes_up,
                bytes_down = report.bytes_down,
                duration_ms = report.duration.as_millis() as u64,
                "bridge closed"
            );
            if let Some(error) = &report.error {
                warn!(peer = %peer, error = %error, "bridge ended with error");
            }

            match self.mode {
                AcceptorMode::OneShot => return Ok(Some(report)),
                AcceptorMode::Persistent => {
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    debug!("returning to accepting");
                }
            }
        }
    }
}

/// Accept errors worth retrying instead of tearing the acceptor down.
fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}
