#![deny(unsafe_code)]

//! WebSocket transport for parley peers.
//!
//! Messages are JSON text frames; one WebSocket message is one parley
//! message. The literal text frames `"ping"` and `"pong"` carry
//! application-level liveness: with a ping interval configured the transport
//! probes the remote periodically and tears the connection down with code
//! 1006 when no reply arrives in time. Inbound `"ping"` frames are answered
//! in place, inbound `"pong"` frames surface as
//! [`TransportEvent::Pong`]. Binary frames are dropped with a warning.
//!
//! # Example
//!
//! ```ignore
//! use parley_session::{Peer, PeerOptions};
//! use parley_websocket::{WsConfig, WsTransport};
//!
//! // Server: accept a WebSocket connection.
//! let (stream, _) = listener.accept().await?;
//! let transport = parley_websocket::accept(stream, WsConfig::default()).await?;
//! let (peer, events, driver) = Peer::new("alice", transport, PeerOptions::default());
//! tokio::spawn(driver.run());
//!
//! // Client: connect to a WebSocket server.
//! let transport = parley_websocket::connect("ws://localhost:9000", WsConfig::default()).await?;
//! ```

use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use parley_session::{Transport, TransportEvent};
use parley_wire::{Message, PING_FRAME, PONG_FRAME, SOFT_DISCONNECT_REASON, close_code};

/// Liveness configuration for a [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// How often to send the `"ping"` probe. `None` disables probing.
    pub ping_interval: Option<Duration>,

    /// How long to wait for `"pong"` after a probe before dropping the
    /// connection with code 1006.
    pub ping_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: None,
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket transport carrying parley messages as JSON text frames.
///
/// Works with any WebSocket stream (TCP, TLS, in-memory duplex).
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
    config: WsConfig,
    ping_interval: Option<Interval>,
    /// Armed after a probe goes out; cleared by the matching `"pong"`.
    pong_deadline: Option<Instant>,
    closed: bool,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a WebSocket stream with liveness probing disabled.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self::with_config(stream, WsConfig::default())
    }

    /// Wrap a WebSocket stream with the given liveness configuration.
    pub fn with_config(stream: WebSocketStream<S>, config: WsConfig) -> Self {
        let ping_interval = config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            stream,
            config,
            ping_interval,
            pong_deadline: None,
            closed: false,
        }
    }

    /// Get a reference to the underlying WebSocket stream.
    pub fn stream(&self) -> &WebSocketStream<S> {
        &self.stream
    }

    /// Get a mutable reference to the underlying WebSocket stream.
    pub fn stream_mut(&mut self) -> &mut WebSocketStream<S> {
        &mut self.stream
    }

    async fn send_close_frame(&mut self, code: u16, reason: &str) {
        // 1005/1006/1015 are reserved and must not appear on the wire; an
        // abnormal close goes out as a bare close frame instead.
        let frame = match code {
            1005 | 1006 | 1015 => None,
            _ => Some(CloseFrame {
                code: code.into(),
                reason: reason.to_owned().into(),
            }),
        };
        let _ = self.stream.send(WsMessage::Close(frame)).await;
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Send one message as a text frame.
    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }

        self.stream
            .send(WsMessage::Text(msg.to_text().into()))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// Receive the next event, driving liveness probes in the meantime.
    async fn recv(&mut self) -> TransportEvent {
        loop {
            let ping_enabled = self.ping_interval.is_some() && !self.closed;
            let pong_deadline = self.pong_deadline;

            tokio::select! {
                item = self.stream.next() => match item {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.as_str() == PING_FRAME {
                            // Answer the probe in place; the peer never sees it.
                            let _ = self
                                .stream
                                .send(WsMessage::Text(PONG_FRAME.into()))
                                .await;
                            continue;
                        }
                        if text.as_str() == PONG_FRAME {
                            self.pong_deadline = None;
                            return TransportEvent::Pong;
                        }
                        match Message::parse(text.as_str()) {
                            Some(msg) => return TransportEvent::Message(msg),
                            None => {
                                warn!("discarding malformed frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("binary frames are not supported, dropping");
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = self.stream.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        self.closed = true;
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((close_code::ABNORMAL, String::new()));
                        debug!(code, %reason, "websocket closed by remote");
                        return TransportEvent::Closed { code, reason };
                    }
                    Some(Err(e)) => {
                        self.closed = true;
                        return TransportEvent::Closed {
                            code: close_code::ABNORMAL,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        self.closed = true;
                        return TransportEvent::Closed {
                            code: close_code::ABNORMAL,
                            reason: "connection closed abnormally".into(),
                        };
                    }
                },

                _ = async {
                    self.ping_interval.as_mut().expect("interval present").tick().await
                }, if ping_enabled => {
                    if self
                        .stream
                        .send(WsMessage::Text(PING_FRAME.into()))
                        .await
                        .is_ok()
                        && self.pong_deadline.is_none()
                    {
                        self.pong_deadline = Some(Instant::now() + self.config.ping_timeout);
                    }
                },

                _ = async {
                    tokio::time::sleep_until(pong_deadline.expect("deadline present")).await
                }, if pong_deadline.is_some() => {
                    warn!("no pong within timeout, dropping connection");
                    self.closed = true;
                    let _ = self.stream.close(None).await;
                    return TransportEvent::Closed {
                        code: close_code::ABNORMAL,
                        reason: "ping timeout".into(),
                    };
                },
            }
        }
    }

    /// Hard close. Sends a close frame once; later calls are no-ops.
    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.send_close_frame(code, reason).await;
    }

    /// Soft close for transport swap: code 4001, reason `"reconnecting"`.
    async fn soft_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.send_close_frame(close_code::SOFT_DISCONNECT, SOFT_DISCONNECT_REASON)
            .await;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl WsTransport<tokio::io::DuplexStream> {
    /// Create a connected transport pair over an in-memory duplex stream.
    ///
    /// Runs a real WebSocket handshake over `tokio::io::duplex`, so framing
    /// behaves exactly like a network connection. Intended for tests.
    pub async fn pair(client: WsConfig, server: WsConfig) -> (Self, Self) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

        let (ws_client, ws_server) = tokio::join!(
            async {
                tokio_tungstenite::client_async("ws://localhost/", client_stream)
                    .await
                    .expect("client handshake failed")
                    .0
            },
            async {
                tokio_tungstenite::accept_async(server_stream)
                    .await
                    .expect("server handshake failed")
            }
        );

        (
            Self::with_config(ws_client, client),
            Self::with_config(ws_server, server),
        )
    }
}

/// Connect to a WebSocket server and wrap the connection as a transport.
pub async fn connect(
    url: &str,
    config: WsConfig,
) -> io::Result<WsTransport<MaybeTlsStream<TcpStream>>> {
    let (stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    Ok(WsTransport::with_config(stream, config))
}

/// Accept a WebSocket handshake on an incoming stream and wrap it as a
/// transport.
pub async fn accept<S>(stream: S, config: WsConfig) -> io::Result<WsTransport<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    Ok(WsTransport::with_config(ws, config))
}
