use std::future::Future;
use std::io;

use parley_wire::Message;

/// A duplex frame-oriented channel carrying parsed messages plus out-of-band
/// liveness and close signals.
///
/// The peer engine owns at most one transport at a time and is the only
/// caller of [`recv`](Transport::recv), so implementations may assume a
/// single receiver. Events must be delivered in arrival order. `recv` must be
/// cancellation safe: the engine races it against its command channel and
/// timers, and a cancelled `recv` must not lose an event.
///
/// After [`Closed`](TransportEvent::Closed) has been returned the engine
/// stops calling `recv` and drops the transport.
pub trait Transport: Send + 'static {
    /// Send one message. Fails when the transport is closed or the
    /// underlying connection refuses the frame.
    fn send(&mut self, msg: &Message) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next inbound event.
    fn recv(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Hard close with a code and reason. Idempotent; a no-op once the
    /// transport is closed.
    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = ()> + Send;

    /// Soft close used during transport swap: closes the underlying
    /// connection with code 4001 and reason `"reconnecting"` so the remote
    /// peer treats the disconnect as non-terminal.
    fn soft_close(&mut self) -> impl Future<Output = ()> + Send;

    /// Whether the transport has been closed, locally or by the remote.
    fn is_closed(&self) -> bool;
}

/// One inbound event from a [`Transport`].
#[derive(Debug)]
pub enum TransportEvent {
    /// A parsed wire message.
    Message(Message),

    /// The remote answered a liveness probe.
    Pong,

    /// The underlying connection closed with the given code and reason.
    Closed { code: u16, reason: String },
}
