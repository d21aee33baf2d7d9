//! Run lifecycle: resolve, listen, bridge, shut down.
//!
//! The supervisor owns the root cancellation token, translates SIGINT and
//! SIGTERM into an idempotent cancel, and maps whatever ended the run onto
//! the single terminal [`ExitStatus`] the CLI reports. It never touches a
//! TCP socket itself; the acceptor owns the listener and every bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use c8ylp_core::{AcceptorMode, ExitStatus, LocalEndpoint, TerminalCause, TunnelDescriptor};

use crate::acceptor::Acceptor;
use crate::bridge::{BridgeConfig, BridgeReport};
use crate::resolver::{CumulocityResolver, ResolveRequest};

/// How long active bridges get to drain after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a full run needs, before the tunnel is resolved.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub resolve: ResolveRequest,
    pub endpoint: LocalEndpoint,
    pub mode: AcceptorMode,
    pub bridge: BridgeConfig,
}

pub struct Supervisor {
    cancel: CancellationToken,
    signals_installed: AtomicBool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            signals_installed: AtomicBool::new(false),
        }
    }

    /// The root cancellation token; child tokens hang off it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Translate SIGINT and SIGTERM into cancellation. Installs at most
    /// once per supervisor.
    pub fn install_signal_handlers(&self) {
        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    /// Resolve the tunnel, then serve it. The full proxy run.
    ///
    /// Resolver failures surface as the terminal status without a local
    /// port ever being bound.
    pub async fn run(
        &self,
        options: RunOptions,
        on_bound: impl FnOnce(u16) + Send,
    ) -> ExitStatus {
        let resolver = match CumulocityResolver::new(
            &options.resolve.host,
            options.resolve.verify_tls,
        ) {
            Ok(resolver) => resolver,
            Err(e) => {
                error!(error = %e, "invalid host");
                return ExitStatus::from(&e);
            }
        };

        let descriptor = tokio::select! {
            result = resolver.resolve(&options.resolve) => match result {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!(error = %e, "could not resolve device tunnel");
                    return ExitStatus::from(&e);
                }
            },
            _ = self.cancel.cancelled() => return ExitStatus::Cancelled,
        };

        info!(
            tenant = %descriptor.tenant,
            device_id = %descriptor.device_id,
            config_id = %descriptor.config_id,
            "device tunnel resolved"
        );

        self.serve(
            Arc::new(descriptor),
            options.endpoint,
            options.mode,
            options.bridge,
            on_bound,
        )
        .await
    }

    /// Serve an already-resolved tunnel descriptor.
    ///
    /// Binds the endpoint, publishes the actual port through `on_bound`
    /// before the first accept, and runs the acceptor until it finishes or
    /// the run is cancelled. Live bridges get [`SHUTDOWN_GRACE`] to drain.
    pub async fn serve(
        &self,
        descriptor: Arc<TunnelDescriptor>,
        endpoint: LocalEndpoint,
        mode: AcceptorMode,
        bridge: BridgeConfig,
        on_bound: impl FnOnce(u16) + Send,
    ) -> ExitStatus {
        if let Err(e) = bridge.validate() {
            error!(error = %e, "invalid bridge configuration");
            return ExitStatus::from(&e);
        }

        let acceptor = Acceptor::new(descriptor, bridge, mode, self.cancel.clone());
        let bound = match acceptor.bind(endpoint).await {
            Ok(bound) => bound,
            Err(e) => {
                error!(error = %e, "could not bind local endpoint");
                return ExitStatus::from(&e);
            }
        };

        on_bound(bound.local_addr().port());

        let run = bound.run();
        tokio::pin!(run);

        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = self.cancel.cancelled() => {
                debug!("cancellation requested, draining acceptor");
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(grace = ?SHUTDOWN_GRACE, "shutdown grace expired");
                        return ExitStatus::Cancelled;
                    }
                }
            }
        };

        let status = match outcome {
            Ok(Some(report)) => one_shot_status(&report),
            Ok(None) => {
                if self.cancel.is_cancelled() {
                    ExitStatus::Cancelled
                } else {
                    ExitStatus::Ok
                }
            }
            Err(e) => ExitStatus::from(&e),
        };

        info!(status = %status, "proxy finished");
        status
    }
}

/// Map a one-shot session's outcome to the process status.
fn one_shot_status(report: &BridgeReport) -> ExitStatus {
    match (&report.cause, &report.error) {
        (TerminalCause::Cancelled, _) => ExitStatus::Cancelled,
        // Idle expiry ends the session normally; its report carries an
        // error describing the deadline, which must not be mapped.
        (TerminalCause::IdleTimeout, _) => ExitStatus::Ok,
        (_, Some(error)) => ExitStatus::from(error),
        (TerminalCause::PeerClosedLocal | TerminalCause::PeerClosedRemote, None) => ExitStatus::Ok,
        (TerminalCause::ErrorLocal | TerminalCause::ErrorRemote, None) => {
            ExitStatus::GenericError
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
