//! WebSocket client for the device tunnel.
//!
//! The gateway exposes one tunnel per device as an authenticated WebSocket
//! endpoint speaking the `binary` subprotocol; every binary frame carries a
//! slice of the device's TCP byte stream. The client here is deliberately
//! narrow: connect, read binary frames, write binary frames, keepalive,
//! close. Multiplexing is not supported by the gateway and not attempted.
//!
//! The sink half is shared behind a mutex so that the uplink pump, the
//! keepalive timer and close frames serialize their writes; the bridge
//! guarantees there is exactly one logical sender and one receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use c8ylp_core::{ProxyError, ProxyResult, TunnelDescriptor};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake timeout for the WebSocket upgrade.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks when the last pong arrived. Shared between the receiver (which
/// stamps it) and the keepalive timer (which checks it).
#[derive(Clone)]
pub struct PongClock(Arc<StdMutex<Instant>>);

impl PongClock {
    fn new() -> Self {
        Self(Arc::new(StdMutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().expect("pong clock poisoned") = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.0.lock().expect("pong clock poisoned").elapsed()
    }
}

/// An open device tunnel, produced by [`connect`].
pub struct WsTunnel {
    sender: TunnelSender,
    receiver: TunnelReceiver,
    pong_clock: PongClock,
}

impl std::fmt::Debug for WsTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTunnel").finish_non_exhaustive()
    }
}

impl WsTunnel {
    /// The shared pong clock, for wiring up [`keepalive`].
    pub fn pong_clock(&self) -> PongClock {
        self.pong_clock.clone()
    }

    /// Split into the write and read halves handed to the two pumps.
    pub fn into_parts(self) -> (TunnelSender, TunnelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Write half of the tunnel. Cloneable; writes are serialized internally.
#[derive(Clone)]
pub struct TunnelSender {
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
    close_sent: Arc<AtomicBool>,
}

impl TunnelSender {
    /// Send one buffer as exactly one binary frame.
    ///
    /// Returns once the frame has been handed to the transport; delivery is
    /// not acknowledged by the peer.
    pub async fn send_binary(&self, data: Vec<u8>) -> ProxyResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data))
            .await
            .map_err(|e| ProxyError::Transport(format!("websocket send failed: {e}")))
    }

    pub async fn ping(&self) -> ProxyResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| ProxyError::Transport(format!("websocket ping failed: {e}")))
    }

    async fn pong(&self, payload: Vec<u8>) -> ProxyResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Pong(payload))
            .await
            .map_err(|e| ProxyError::Transport(format!("websocket pong failed: {e}")))
    }

    /// Send a close frame if none has been sent yet. Idempotent; errors are
    /// swallowed because the transport may already be gone.
    pub async fn close(&self, code: CloseCode, reason: &'static str) {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "close frame not sent, transport already down");
        }
    }
}

/// Read half of the tunnel. Single owner; the downlink pump drives it.
pub struct TunnelReceiver {
    stream: SplitStream<WsStream>,
    sender: TunnelSender,
    pong_clock: PongClock,
}

impl TunnelReceiver {
    /// Next binary payload from the tunnel.
    ///
    /// Pings are answered transparently, pongs stamp the keepalive clock.
    /// `Ok(None)` means the peer closed the tunnel cleanly; a text frame is
    /// a protocol violation in a binary tunnel.
    pub async fn next_binary(&mut self) -> ProxyResult<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = self.sender.pong(payload).await {
                        return Err(e);
                    }
                }
                Some(Ok(Message::Pong(_))) => self.pong_clock.touch(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return Ok(None);
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(ProxyError::Protocol(
                        "text frame received in binary tunnel".into(),
                    ))
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(map_stream_error(e)),
                None => return Ok(None),
            }
        }
    }
}

/// Open the tunnel described by `descriptor`.
///
/// The upgrade request carries `Authorization: Bearer <token>` and asks for
/// the `binary` subprotocol. TLS peer verification follows the descriptor.
pub async fn connect(descriptor: &TunnelDescriptor) -> ProxyResult<WsTunnel> {
    let url = descriptor.tunnel_url();
    debug!(url = %url, "opening websocket tunnel");

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::Protocol(format!("invalid tunnel url: {e}")))?;
    let bearer = format!("Bearer {}", descriptor.token.expose());
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&bearer)
            .map_err(|_| ProxyError::Protocol("token is not a valid header value".into()))?,
    );
    headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));

    let connector = if descriptor.verify_tls {
        None
    } else {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ProxyError::Transport(format!("tls connector: {e}")))?;
        Some(Connector::NativeTls(tls))
    };

    let handshake = connect_async_tls_with_config(request, None, true, connector);
    let (ws, response) = match tokio::time::timeout(CONNECT_TIMEOUT, handshake).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(map_handshake_error(e)),
        Err(_) => {
            return Err(ProxyError::TunnelUnavailable(format!(
                "websocket handshake timed out after {CONNECT_TIMEOUT:?}"
            )))
        }
    };

    // A gateway that negotiates a different subprotocol is not speaking the
    // tunnel protocol; no data must flow over such a connection.
    if let Some(proto) = response.headers().get("sec-websocket-protocol") {
        if proto != "binary" {
            return Err(ProxyError::Protocol(format!(
                "unexpected subprotocol negotiated: {proto:?}"
            )));
        }
    }

    let (sink, stream) = ws.split();
    let sender = TunnelSender {
        sink: Arc::new(Mutex::new(sink)),
        close_sent: Arc::new(AtomicBool::new(false)),
    };
    let pong_clock = PongClock::new();
    let receiver = TunnelReceiver {
        stream,
        sender: sender.clone(),
        pong_clock: pong_clock.clone(),
    };

    Ok(WsTunnel {
        sender,
        receiver,
        pong_clock,
    })
}

/// Keepalive timer: ping every `interval`, fail when two consecutive
/// intervals pass without a pong.
///
/// Resolves only on failure; with a zero interval it never resolves.
pub async fn keepalive(
    sender: TunnelSender,
    pong_clock: PongClock,
    interval: Duration,
) -> ProxyError {
    if interval.is_zero() {
        return std::future::pending().await;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if pong_clock.elapsed() >= interval * 2 {
            warn!(interval = ?interval, "no pong within two ping intervals");
            return ProxyError::Transport(format!(
                "keepalive failed: no pong within {:?}",
                interval * 2
            ));
        }
        if let Err(e) = sender.ping().await {
            return e;
        }
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ProxyError {
    use tokio_tungstenite::tungstenite::http::StatusCode;

    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ProxyError::Auth(format!("websocket upgrade rejected (status {status})"))
                }
                StatusCode::NOT_FOUND => {
                    ProxyError::DeviceNotFound(format!("tunnel endpoint not found (status {status})"))
                }
                StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => {
                    ProxyError::TunnelUnavailable(format!("gateway returned status {status}"))
                }
                _ => ProxyError::Protocol(format!("unexpected upgrade response: {status}")),
            }
        }
        tungstenite::Error::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
            ) =>
        {
            ProxyError::TunnelUnavailable(format!("gateway unreachable: {e}"))
        }
        tungstenite::Error::Tls(e) => ProxyError::Transport(format!("tls handshake failed: {e}")),
        other => ProxyError::TunnelUnavailable(format!("websocket connect failed: {other}")),
    }
}

fn map_stream_error(err: tungstenite::Error) -> ProxyError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ProxyError::Transport("websocket closed".into())
        }
        tungstenite::Error::Protocol(e) => {
            ProxyError::Transport(format!("websocket protocol error: {e}"))
        }
        other => ProxyError::Transport(format!("websocket read failed: {other}")),
    }
}

// Re-exported so the bridge can pick close codes without importing
// tungstenite directly.
pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as TunnelCloseCode;
