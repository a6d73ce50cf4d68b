use std::fmt;

use parley_wire::{ErrorResponse, Message, Notification, Request};
use serde_json::Value;
use tokio::sync::mpsc;

/// Error code used when an inbound request fails inside the application
/// rather than being rejected with an explicit code.
const INTERNAL_ERROR_CODE: i32 = 500;

/// One event observed on a peer.
#[derive(Debug)]
pub enum PeerEvent {
    /// An inbound request. Answer it with [`IncomingRequest::accept`] or
    /// [`IncomingRequest::reject`].
    Request(IncomingRequest),

    /// An inbound notification.
    Notification(Notification),

    /// The remote answered a liveness probe.
    Pong,

    /// The peer closed. Emitted exactly once per peer.
    Close { code: u16, reason: String },
}

/// Receiving half of a peer's event stream.
///
/// Events arrive in the order the frames arrived on the transport. Dropping
/// this value detaches the application: further inbound requests and
/// notifications are logged and discarded by the engine.
pub struct PeerEvents {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event. Returns `None` once the peer's driver has
    /// stopped and all queued events have been drained.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }
}

/// An inbound request waiting for an answer.
///
/// Exactly one response is sent per request: `accept` sends a success
/// response, `reject` an error response. If the value is dropped without
/// responding (including when an application task panics while holding it),
/// the remote receives a code-500 error response instead of waiting for a
/// reply that will never come.
#[derive(Debug)]
pub struct IncomingRequest {
    request: Request,
    responder: Responder,
}

impl IncomingRequest {
    pub(crate) fn new(request: Request, tx: mpsc::UnboundedSender<Message>) -> Self {
        let id = request.id;
        Self {
            request,
            responder: Responder {
                id,
                tx,
                responded: false,
            },
        }
    }

    /// The request id.
    pub fn id(&self) -> u32 {
        self.request.id
    }

    /// The requested method.
    pub fn method(&self) -> &str {
        &self.request.method
    }

    /// The request payload, if any.
    pub fn data(&self) -> Option<&Value> {
        self.request.data.as_ref()
    }

    /// The full request message.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Answer with a success response.
    pub fn accept(mut self, data: Option<Value>) {
        let msg = self.request.success_response(data);
        self.responder.send(msg);
    }

    /// Answer with an error response carrying `code` and `reason`.
    ///
    /// `reason` accepts anything displayable, so an error value can be passed
    /// directly: `request.reject(418, err)` uses the error's message as the
    /// reason.
    pub fn reject(mut self, code: i32, reason: impl fmt::Display) {
        let msg = self.request.error_response(code, reason.to_string());
        self.responder.send(msg);
    }

    /// Answer with a code-500 error response whose reason is the error's
    /// message.
    pub fn reject_with(self, error: impl fmt::Display) {
        self.reject(INTERNAL_ERROR_CODE, error);
    }

    /// Discard this request without sending any response.
    ///
    /// Used by the engine when no listener is attached; the frame is dropped
    /// rather than auto-rejected.
    pub(crate) fn disarm(mut self) {
        self.responder.responded = true;
    }
}

#[derive(Debug)]
struct Responder {
    id: u32,
    tx: mpsc::UnboundedSender<Message>,
    responded: bool,
}

impl Responder {
    fn send(&mut self, msg: Message) {
        self.responded = true;
        // The driver going away means there is no transport to answer on.
        let _ = self.tx.send(msg);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.responded {
            let _ = self.tx.send(Message::ErrorResponse(ErrorResponse {
                id: self.id,
                error_code: INTERNAL_ERROR_CODE,
                error_reason: "request handler failed".into(),
            }));
        }
    }
}
