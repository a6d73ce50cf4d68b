//! In-memory transport for exercising the peer engine without sockets.

use std::io;

use parley_session::{Transport, TransportEvent};
use parley_wire::{Message, SOFT_DISCONNECT_REASON, close_code};
use tokio::sync::mpsc;

/// One frame on the in-memory wire.
#[derive(Debug)]
pub enum Frame {
    Text(String),
    Pong,
    Close { code: u16, reason: String },
}

/// A channel-backed transport half. Frames sent on one half arrive on the
/// other in order, like a WebSocket without the sockets.
pub struct MemTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    closed: bool,
}

impl MemTransport {
    /// Create a connected pair.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemTransport {
                tx: a_tx,
                rx: a_rx,
                closed: false,
            },
            MemTransport {
                tx: b_tx,
                rx: b_rx,
                closed: false,
            },
        )
    }

    /// Push a raw text frame to the other half.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(Frame::Text(text.into()));
    }

    /// Push a liveness reply to the other half.
    pub fn send_pong(&self) {
        let _ = self.tx.send(Frame::Pong);
    }

    /// Stop accepting frames from the other half without closing this half's
    /// sending side. The other half's next `send` fails.
    pub fn shutdown_read(&mut self) {
        self.rx.close();
    }
}

impl Transport for MemTransport {
    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.tx
            .send(Frame::Text(msg.to_text()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote gone"))
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.rx.recv().await {
                Some(Frame::Text(text)) => match Message::parse(&text) {
                    Some(msg) => return TransportEvent::Message(msg),
                    None => continue,
                },
                Some(Frame::Pong) => return TransportEvent::Pong,
                Some(Frame::Close { code, reason }) => {
                    self.closed = true;
                    return TransportEvent::Closed { code, reason };
                }
                None => {
                    self.closed = true;
                    return TransportEvent::Closed {
                        code: close_code::ABNORMAL,
                        reason: "connection closed abnormally".into(),
                    };
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Frame::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    async fn soft_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Frame::Close {
            code: close_code::SOFT_DISCONNECT,
            reason: SOFT_DISCONNECT_REASON.to_owned(),
        });
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
