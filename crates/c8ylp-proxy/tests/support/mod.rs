//! Test doubles: a mock remote-access gateway (WebSocket) and a minimal
//! Cumulocity REST endpoint.

// Each test binary uses a subset of these helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// How a mock gateway connection behaves after the handshake.
#[derive(Debug, Clone, Copy)]
pub enum GatewayBehavior {
    /// Echo every binary frame back to the client.
    Echo,
    /// Complete the handshake, then never read. No pongs ever arrive.
    Blackhole,
    /// Echo until the given byte count, then drop the TCP connection
    /// without a close handshake.
    AbortAfter(u64),
}

/// What one gateway connection observed.
#[derive(Debug, Default, Clone)]
pub struct ConnRecord {
    pub bytes_received: u64,
    /// Close code sent by the proxy, if the session ended with one.
    pub close_code: Option<u16>,
    /// Bytes received at the moment the close frame arrived.
    pub bytes_at_close: u64,
}

/// A WebSocket gateway double that accepts tunnel upgrades.
pub struct MockGateway {
    pub addr: SocketAddr,
    pub records: Arc<Mutex<Vec<ConnRecord>>>,
}

impl MockGateway {
    /// Spawn a gateway accepting connections authenticated with `token`.
    /// Upgrades without the right bearer are rejected with 401.
    pub async fn spawn(token: &str, behavior: GatewayBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let records: Arc<Mutex<Vec<ConnRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let expected = format!("Bearer {token}");

        let accept_records = records.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let expected = expected.clone();
                let records = accept_records.clone();
                tokio::spawn(async move {
                    if let Some(record) = serve_conn(stream, &expected, behavior).await {
                        records.lock().unwrap().push(record);
                    }
                });
            }
        });

        Self { addr, records }
    }

    /// Base URL for building a tunnel descriptor against this gateway.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn records(&self) -> Vec<ConnRecord> {
        self.records.lock().unwrap().clone()
    }
}

async fn serve_conn(
    stream: TcpStream,
    expected_auth: &str,
    behavior: GatewayBehavior,
) -> Option<ConnRecord> {
    let expected = expected_auth.to_string();
    let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let authorized = req
            .headers()
            .get("Authorization")
            .map(|value| value == expected.as_str())
            .unwrap_or(false);
        if !authorized {
            let reject = tokio_tungstenite::tungstenite::http::Response::builder()
                .status(401)
                .body(None)
                .unwrap();
            return Err(reject);
        }
        resp.headers_mut()
            .append("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return None,
    };

    let mut record = ConnRecord::default();

    if matches!(behavior, GatewayBehavior::Blackhole) {
        // Hold the connection open without ever reading. Keepalive pings
        // from the proxy go unanswered.
        let _hold = ws;
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        return Some(record);
    }

    let (mut sink, mut stream) = ws.split();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                record.bytes_received += data.len() as u64;
                if sink.send(Message::Binary(data)).await.is_err() {
                    break;
                }
                if let GatewayBehavior::AbortAfter(limit) = behavior {
                    if record.bytes_received >= limit {
                        // Drop without a close handshake.
                        return Some(record);
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                record.close_code = frame.map(|f| f.code.into());
                record.bytes_at_close = record.bytes_received;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    Some(record)
}

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl MockResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type RestHandler = dyn Fn(&str, &str, &str) -> MockResponse + Send + Sync;

/// A minimal HTTP/1.1 responder for the Cumulocity REST surface.
///
/// The handler receives `(method, path, body)` and returns the canned
/// response; per-path state (hit counters) lives in the closure.
pub struct MockRest {
    pub addr: SocketAddr,
}

impl MockRest {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &str) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Arc<RestHandler> = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _ = serve_http(stream, handler).await;
                });
            }
        });

        Self { addr }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn serve_http(mut stream: TcpStream, handler: Arc<RestHandler>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until the end of the header block.
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let response = handler(&method, &path, &body);
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        reason(response.status),
        response.body.len()
    );
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(&response.body);

    stream.write_all(out.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Deterministic pseudo-random payload for fidelity tests.
pub fn patterned_payload(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.max(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}
