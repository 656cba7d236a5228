//! WebSocket transport for recognition sessions
//!
//! The session driver talks to the network only through the [`Connector`]
//! and [`Transport`] traits, so sessions can run against a scripted
//! transport in tests.
//!
//! # Connection Flow
//!
//! 1. `connect()` - WebSocket handshake against the signed URL (with timeout)
//! 2. `send_text()` - JSON frames
//! 3. `next_event()` - inbound text, close or error
//! 4. `close()` - client-side close with a close code (idempotent)

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::{RecognitionError, SignedEndpoint};

/// WebSocket normal closure
pub const NORMAL_CLOSURE: u16 = 1000;

/// What the transport observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text message
    Message(String),
    /// The connection closed (code is None if no close frame was received)
    Closed { code: Option<u16>, reason: String },
    /// The connection failed
    Error(RecognitionError),
}

/// An open, bidirectional message channel
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), RecognitionError>;

    /// Wait for the next inbound event
    ///
    /// Must be cancel-safe: the driver polls it inside `tokio::select!`.
    async fn next_event(&mut self) -> TransportEvent;

    /// Close from the client side. Closing twice is a no-op.
    async fn close(&mut self, code: u16);
}

/// Opens transports for signed endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(&self, endpoint: &SignedEndpoint) -> Result<Self::Transport, RecognitionError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        // rustls needs a process-wide crypto provider; a second install is
        // rejected, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, endpoint: &SignedEndpoint) -> Result<WsTransport, RecognitionError> {
        log::info!("Transport: connecting to {}", endpoint.redacted());

        let (stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(
                endpoint.url.as_str(),
                None,
                true, // disable_nagle: frames are small and paced
            ),
        )
        .await
        .map_err(|_| RecognitionError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(classify_connect_error)?;

        log::info!("Transport: WebSocket connected");
        Ok(WsTransport::new(stream))
    }
}

/// Map a handshake failure onto the error taxonomy
///
/// 401/403 mean the signature or credentials were rejected.
fn classify_connect_error(err: tungstenite::Error) -> RecognitionError {
    match &err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or(Cow::Borrowed(""));
            if status == 401 || status == 403 {
                RecognitionError::AuthenticationFailed(format!(
                    "HTTP {}: check app id, API key and API secret ({})",
                    status, body
                ))
            } else {
                RecognitionError::ConnectionFailed(format!("HTTP {}: {}", status, body))
            }
        }
        _ => RecognitionError::ConnectionFailed(err.to_string()),
    }
}

/// An open tokio-tungstenite WebSocket
pub struct WsTransport {
    stream: WsStream,
    closed: bool,
}

impl WsTransport {
    pub fn new(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), RecognitionError> {
        if self.closed {
            return Err(RecognitionError::Transport("Connection already closed".to_string()));
        }
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| RecognitionError::Transport(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text),
                Some(Ok(Message::Binary(bytes))) => {
                    // The service only sends text, but accept UTF-8 binary frames.
                    match String::from_utf8(bytes) {
                        Ok(text) => return TransportEvent::Message(text),
                        Err(_) => log::warn!("Transport: ignoring non-UTF-8 binary frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    log::info!("Transport: closed by server (code: {:?})", code);
                    return TransportEvent::Closed { code, reason };
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    self.closed = true;
                    return TransportEvent::Closed {
                        code: None,
                        reason: "Stream ended".to_string(),
                    };
                }
                Some(Err(e)) => {
                    log::warn!("Transport: WebSocket error: {}", e);
                    return TransportEvent::Error(RecognitionError::Transport(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self, code: u16) {
        if self.closed {
            return;
        }
        self.closed = true;

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(""),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            log::debug!("Transport: error closing WebSocket: {}", e);
        }
    }
}
