//! One local-TCP-to-WebSocket session.
//!
//! A bridge couples a single accepted TCP socket with a single tunnel and
//! runs two byte pumps until either side ends. The first terminating event
//! (pump exit, idle deadline, keepalive failure, parent cancellation) fixes
//! the terminal cause; everything after that is teardown.
//!
//! Payloads are forwarded untouched in both directions. Backpressure is the
//! natural one: a stalled TCP write stalls WebSocket reads for this bridge
//! and vice versa, with at most one in-flight chunk per direction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use c8ylp_core::{ProxyError, TerminalCause, TunnelDescriptor};

use crate::tunnel::{self, TunnelCloseCode, TunnelReceiver, TunnelSender};

/// Smallest accepted uplink read chunk.
pub const TCP_SIZE_MIN: usize = 1024;
/// Largest accepted uplink read chunk.
pub const TCP_SIZE_MAX: usize = 8_290_304;
/// Default uplink read chunk.
pub const TCP_SIZE_DEFAULT: usize = 4096;

/// Grace granted to the surviving pump to drain after the first terminal
/// event.
const DRAIN_GRACE: Duration = Duration::from_secs(3);
/// Grace after a cancellation; cancellation must unblock quickly.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Per-bridge tuning, shared by every bridge of a run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum bytes per TCP read; each non-empty read becomes one frame.
    pub tcp_size: usize,
    /// Idle deadline, reset by any byte in either direction. Zero disables.
    pub tcp_timeout: Duration,
    /// WebSocket keepalive ping period. Zero disables.
    pub ping_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tcp_size: TCP_SIZE_DEFAULT,
            tcp_timeout: Duration::ZERO,
            ping_interval: Duration::ZERO,
        }
    }
}

impl BridgeConfig {
    /// Reject chunk sizes outside the accepted range.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.tcp_size < TCP_SIZE_MIN || self.tcp_size > TCP_SIZE_MAX {
            return Err(ProxyError::InvalidConfig(format!(
                "tcp size {} outside accepted range {}..={}",
                self.tcp_size, TCP_SIZE_MIN, TCP_SIZE_MAX
            )));
        }
        Ok(())
    }
}

/// What a finished bridge reports back to the acceptor.
#[derive(Debug)]
pub struct BridgeReport {
    pub cause: TerminalCause,
    pub error: Option<ProxyError>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
}

/// Byte counters plus the idle clock, stamped by both pumps.
struct Activity {
    last: StdMutex<Instant>,
    up: AtomicU64,
    down: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: StdMutex::new(Instant::now()),
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
        }
    }

    fn record_up(&self, n: usize) {
        self.up.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    fn record_down(&self, n: usize) {
        self.down.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        *self.last.lock().expect("activity clock poisoned") = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *self.last.lock().expect("activity clock poisoned")
    }
}

/// Outcome of a single pump.
struct PumpEnd {
    cause: TerminalCause,
    error: Option<ProxyError>,
}

enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

/// Run one bridge session to completion.
///
/// Opens the tunnel, pumps bytes both ways and coordinates shutdown. On a
/// tunnel connect failure the TCP socket is closed before any byte reaches
/// the local client.
pub async fn run(
    tcp: TcpStream,
    descriptor: Arc<TunnelDescriptor>,
    config: &BridgeConfig,
    parent: &CancellationToken,
) -> BridgeReport {
    let started = Instant::now();

    let tunnel = match tunnel::connect(&descriptor).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            // The local client sees a close with no bytes exchanged.
            drop(tcp);
            return BridgeReport {
                cause: TerminalCause::ErrorRemote,
                error: Some(e),
                bytes_up: 0,
                bytes_down: 0,
                duration: started.elapsed(),
            };
        }
    };

    let pong_clock = tunnel.pong_clock();
    let (sender, receiver) = tunnel.into_parts();
    let cancel = parent.child_token();
    let activity = Arc::new(Activity::new());
    let (tcp_read, tcp_write) = tcp.into_split();

    let (done_tx, mut done_rx) = mpsc::channel::<(Direction, PumpEnd)>(2);

    let up_handle = {
        let sender = sender.clone();
        let activity = activity.clone();
        let cancel = cancel.clone();
        let done_tx = done_tx.clone();
        let tcp_size = config.tcp_size;
        tokio::spawn(async move {
            let end = uplink(tcp_read, sender, activity, tcp_size, cancel).await;
            let _ = done_tx.send((Direction::Uplink, end)).await;
        })
    };

    let down_handle = {
        let sender = sender.clone();
        let activity = activity.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let end = downlink(receiver, tcp_write, sender, activity, cancel).await;
            let _ = done_tx.send((Direction::Downlink, end)).await;
        })
    };

    let idle = idle_watch(activity.clone(), config.tcp_timeout);
    let keepalive = tunnel::keepalive(sender.clone(), pong_clock, config.ping_interval);
    tokio::pin!(idle);
    tokio::pin!(keepalive);

    // First event wins; it fixes the terminal cause.
    let mut pumps_done = 0usize;
    let (cause, error) = tokio::select! {
        Some((_, end)) = done_rx.recv() => {
            pumps_done += 1;
            (end.cause, end.error)
        }
        _ = &mut idle => {
            debug!(timeout = ?config.tcp_timeout, "idle deadline expired");
            (TerminalCause::IdleTimeout, Some(ProxyError::IdleTimeout(config.tcp_timeout)))
        }
        err = &mut keepalive => {
            (TerminalCause::ErrorRemote, Some(err))
        }
        _ = parent.cancelled() => {
            (TerminalCause::Cancelled, None)
        }
    };

    // Teardown: close the tunnel, then let the surviving pump drain within
    // a bounded grace. Cancellation forces sockets shut to bound latency.
    let close_code = match cause {
        TerminalCause::PeerClosedLocal | TerminalCause::PeerClosedRemote => {
            TunnelCloseCode::Normal
        }
        TerminalCause::IdleTimeout | TerminalCause::Cancelled => TunnelCloseCode::Away,
        TerminalCause::ErrorLocal | TerminalCause::ErrorRemote => TunnelCloseCode::Error,
    };
    sender.close(close_code, cause.as_str()).await;

    // Clean peer closes get a drain window for in-flight bytes; errors,
    // idle expiry and cancellation force the sockets shut promptly.
    let grace = match cause {
        TerminalCause::PeerClosedLocal | TerminalCause::PeerClosedRemote => DRAIN_GRACE,
        _ => {
            cancel.cancel();
            CANCEL_GRACE
        }
    };

    let mut deadline = Instant::now() + grace;
    while pumps_done < 2 {
        match tokio::time::timeout_at(deadline, done_rx.recv()).await {
            Ok(Some((direction, late))) => {
                pumps_done += 1;
                // Sticky terminal cause: later events are logged only.
                debug!(
                    pump = direction.as_str(),
                    cause = %late.cause,
                    "pump finished during teardown"
                );
            }
            Ok(None) => break,
            Err(_) => {
                if cancel.is_cancelled() {
                    warn!("pump did not stop within grace, aborting");
                    up_handle.abort();
                    down_handle.abort();
                    break;
                }
                cancel.cancel();
                deadline = Instant::now() + Duration::from_secs(1);
            }
        }
    }

    BridgeReport {
        cause,
        error,
        bytes_up: activity.up.load(Ordering::Relaxed),
        bytes_down: activity.down.load(Ordering::Relaxed),
        duration: started.elapsed(),
    }
}

/// TCP to WebSocket: every non-empty read becomes one binary frame.
async fn uplink(
    mut tcp: OwnedReadHalf,
    sender: TunnelSender,
    activity: Arc<Activity>,
    tcp_size: usize,
    cancel: CancellationToken,
) -> PumpEnd {
    let mut buf = vec![0u8; tcp_size];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                return PumpEnd { cause: TerminalCause::Cancelled, error: None };
            }
            r = tcp.read(&mut buf) => r,
        };

        match read {
            Ok(0) => {
                debug!("local peer closed its write side");
                sender.close(TunnelCloseCode::Normal, "local peer closed").await;
                return PumpEnd {
                    cause: TerminalCause::PeerClosedLocal,
                    error: None,
                };
            }
            Ok(n) => {
                activity.record_up(n);
                if let Err(e) = sender.send_binary(buf[..n].to_vec()).await {
                    return PumpEnd {
                        cause: TerminalCause::ErrorRemote,
                        error: Some(e),
                    };
                }
            }
            Err(e) => {
                sender.close(TunnelCloseCode::Error, "local read failed").await;
                return PumpEnd {
                    cause: TerminalCause::ErrorLocal,
                    error: Some(e.into()),
                };
            }
        }
    }
}

/// WebSocket to TCP: every binary frame is written out in full.
async fn downlink(
    mut receiver: TunnelReceiver,
    mut tcp: OwnedWriteHalf,
    sender: TunnelSender,
    activity: Arc<Activity>,
    cancel: CancellationToken,
) -> PumpEnd {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tcp.shutdown().await;
                return PumpEnd { cause: TerminalCause::Cancelled, error: None };
            }
            f = receiver.next_binary() => f,
        };

        match frame {
            Ok(Some(data)) => {
                activity.record_down(data.len());
                if let Err(e) = tcp.write_all(&data).await {
                    sender.close(TunnelCloseCode::Error, "local write failed").await;
                    return PumpEnd {
                        cause: TerminalCause::ErrorLocal,
                        error: Some(e.into()),
                    };
                }
            }
            Ok(None) => {
                // Flush buffered downlink bytes and half-close for writing.
                let _ = tcp.shutdown().await;
                return PumpEnd {
                    cause: TerminalCause::PeerClosedRemote,
                    error: None,
                };
            }
            Err(e) => {
                let _ = tcp.shutdown().await;
                return PumpEnd {
                    cause: TerminalCause::ErrorRemote,
                    error: Some(e),
                };
            }
        }
    }
}

/// Resolves when no byte has moved in either direction for `timeout`.
/// Never resolves when the timeout is zero.
async fn idle_watch(activity: Arc<Activity>, timeout: Duration) {
    if timeout.is_zero() {
        return std::future::pending().await;
    }
    loop {
        let deadline = activity.last_activity() + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        let mut cfg = BridgeConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.tcp_size = TCP_SIZE_MIN;
        assert!(cfg.validate().is_ok());
        cfg.tcp_size = TCP_SIZE_MAX;
        assert!(cfg.validate().is_ok());

        cfg.tcp_size = TCP_SIZE_MIN - 1;
        assert!(cfg.validate().is_err());
        cfg.tcp_size = TCP_SIZE_MAX + 1;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn idle_watch_fires_after_quiet_period() {
        tokio::time::pause();
        let activity = Arc::new(Activity::new());
        let watch = idle_watch(activity.clone(), Duration::from_secs(2));
        tokio::pin!(watch);

        // Activity at t+1s pushes the deadline out.
        tokio::select! {
            _ = &mut watch => panic!("fired too early"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => activity.touch(),
        }

        tokio::time::timeout(Duration::from_secs(3), watch)
            .await
            .expect("idle watch should fire once traffic stops");
    }

    #[tokio::test]
    async fn idle_watch_disabled_never_fires() {
        tokio::time::pause();
        let activity = Arc::new(Activity::new());
        let fired = tokio::time::timeout(
            Duration::from_secs(3600),
            idle_watch(activity, Duration::ZERO),
        )
        .await;
        assert!(fired.is_err());
    }
}
