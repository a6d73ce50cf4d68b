use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{NotifyError, RequestError};
use crate::events::{IncomingRequest, PeerEvent};
use crate::peer::{PeerOptions, PeerShared};
use crate::transport::{Transport, TransportEvent};
use parley_wire::{Message, REMOTE_DROP_REASON, RequestIdGenerator, close_code};

/// Commands sent from [`Peer`](crate::Peer) handles to the driver.
pub(crate) enum DriverCommand<T> {
    Request {
        method: String,
        data: Option<Value>,
        reply: oneshot::Sender<Result<Option<Value>, RequestError>>,
    },
    Notify {
        method: String,
        data: Option<Value>,
        reply: oneshot::Sender<Result<(), NotifyError>>,
    },
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<()>,
    },
    SetTransport {
        transport: T,
        done: oneshot::Sender<()>,
    },
}

/// One outstanding request: the requester's completion channel and the
/// deadline fixed at registration time.
struct PendingRequest {
    method: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<Option<Value>, RequestError>>,
}

/// What one turn of the event loop observed.
enum Step<T> {
    Command(Option<DriverCommand<T>>),
    Outbound(Message),
    Transport(TransportEvent),
    RequestDeadline,
    IdleDeadline,
}

/// The task that owns a peer's transport.
///
/// Only `run` touches the transport. Inbound frames are classified and
/// routed here: responses into the pending table, requests and notifications
/// to the event stream. Because every pending-table removal happens on this
/// task, remove-if-present is the linearization point between response
/// arrival, deadline expiry, close, and transport swap. Whichever removes
/// the entry settles the request, and later paths see an empty slot.
pub struct Driver<T: Transport> {
    shared: Arc<PeerShared>,
    options: PeerOptions,

    /// The live transport. `None` while soft-disconnected (between
    /// transports) and after close.
    transport: Option<T>,

    command_rx: mpsc::UnboundedReceiver<DriverCommand<T>>,
    commands_open: bool,

    /// Responses produced by [`IncomingRequest`] responders.
    respond_tx: mpsc::UnboundedSender<Message>,
    respond_rx: mpsc::UnboundedReceiver<Message>,

    events_tx: mpsc::UnboundedSender<PeerEvent>,

    pending: HashMap<u32, PendingRequest>,
    ids: RequestIdGenerator,

    reconnecting: bool,
    closed: bool,
    idle_deadline: Option<Instant>,
}

impl<T: Transport> Driver<T> {
    pub(crate) fn new(
        shared: Arc<PeerShared>,
        options: PeerOptions,
        transport: T,
        command_rx: mpsc::UnboundedReceiver<DriverCommand<T>>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (respond_tx, respond_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            options,
            transport: Some(transport),
            command_rx,
            commands_open: true,
            respond_tx,
            respond_rx,
            events_tx,
            pending: HashMap::new(),
            ids: RequestIdGenerator::new(),
            reconnecting: false,
            closed: false,
            idle_deadline: None,
        }
    }

    /// Run until the peer closes.
    pub async fn run(mut self) {
        // A transport that is already closed when attached never produces a
        // close event of its own; close the peer up front. The Close event
        // waits in the event channel until the application reads it.
        if self.transport.as_ref().is_none_or(Transport::is_closed) {
            self.shutdown(close_code::ABNORMAL, "transport already closed", false)
                .await;
            return;
        }

        self.arm_idle_deadline();

        loop {
            let commands_open = self.commands_open;
            let transport_up = self.transport.is_some();
            let request_deadline = self.pending.values().map(|p| p.deadline).min();
            let idle_deadline = self.idle_deadline;

            let step: Step<T> = tokio::select! {
                cmd = self.command_rx.recv(), if commands_open => Step::Command(cmd),

                msg = self.respond_rx.recv() => match msg {
                    Some(msg) => Step::Outbound(msg),
                    // The driver holds a responder sender, so the channel
                    // cannot close.
                    None => continue,
                },

                ev = async {
                    self.transport.as_mut().expect("transport present").recv().await
                }, if transport_up => Step::Transport(ev),

                _ = async {
                    tokio::time::sleep_until(request_deadline.expect("deadline present")).await
                }, if request_deadline.is_some() => Step::RequestDeadline,

                _ = async {
                    tokio::time::sleep_until(idle_deadline.expect("deadline present")).await
                }, if idle_deadline.is_some() => Step::IdleDeadline,
            };

            match step {
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Command(None) => {
                    self.commands_open = false;
                    // With every handle gone and no transport to wait on,
                    // no replacement can ever arrive.
                    if self.transport.is_none() {
                        self.shutdown(close_code::ABNORMAL, "peer handle dropped", false)
                            .await;
                    }
                }
                Step::Outbound(msg) => self.send_response(msg).await,
                Step::Transport(ev) => self.handle_transport_event(ev).await,
                Step::RequestDeadline => self.expire_requests(),
                Step::IdleDeadline => self.handle_idle_timeout().await,
            }

            if self.closed {
                break;
            }
        }
    }

    async fn handle_command(&mut self, cmd: DriverCommand<T>) {
        match cmd {
            DriverCommand::Request { method, data, reply } => {
                self.handle_request(method, data, reply).await;
            }
            DriverCommand::Notify { method, data, reply } => {
                self.handle_notify(method, data, reply).await;
            }
            DriverCommand::Close { code, reason, done } => {
                self.shutdown(code, &reason, true).await;
                let _ = done.send(());
            }
            DriverCommand::SetTransport { transport, done } => {
                self.swap_transport(transport).await;
                let _ = done.send(());
            }
        }
    }

    async fn handle_request(
        &mut self,
        method: String,
        data: Option<Value>,
        reply: oneshot::Sender<Result<Option<Value>, RequestError>>,
    ) {
        // Between transports a request resolves empty without being sent:
        // callers get no response and no error until the swap completes.
        if self.reconnecting || self.transport.is_none() {
            let _ = reply.send(Ok(None));
            return;
        }

        let id = self.ids.next();
        let msg = Message::request(id, &method, data);
        let transport = self.transport.as_mut().expect("transport present");

        match transport.send(&msg).await {
            Ok(()) => {
                let timeout = self.options.request_timeout(self.pending.len());
                debug!(peer = %self.shared.id, id, method = %method, ?timeout, "request sent");
                self.pending.insert(
                    id,
                    PendingRequest {
                        method,
                        deadline: Instant::now() + timeout,
                        reply,
                    },
                );
            }
            Err(e) => {
                let _ = reply.send(Err(RequestError::Send(e)));
            }
        }
    }

    async fn handle_notify(
        &mut self,
        method: String,
        data: Option<Value>,
        reply: oneshot::Sender<Result<(), NotifyError>>,
    ) {
        if self.reconnecting || self.transport.is_none() {
            let _ = reply.send(Ok(()));
            return;
        }

        let msg = Message::notification(&method, data);
        let transport = self.transport.as_mut().expect("transport present");
        let result = transport.send(&msg).await.map_err(NotifyError::Send);
        let _ = reply.send(result);
    }

    /// Send a response produced by an [`IncomingRequest`] responder.
    async fn send_response(&mut self, msg: Message) {
        if self.transport.is_none() {
            warn!(peer = %self.shared.id, "dropping response, transport is down");
            return;
        }
        let transport = self.transport.as_mut().expect("transport present");
        if let Err(e) = transport.send(&msg).await {
            warn!(peer = %self.shared.id, error = %e, "failed to send response");
        }
    }

    async fn handle_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Message(msg) => {
                self.touch();
                self.dispatch_message(msg);
            }
            TransportEvent::Pong => {
                self.touch();
                let _ = self.events_tx.send(PeerEvent::Pong);
            }
            TransportEvent::Closed { code, reason } => {
                self.transport = None;
                if code == close_code::SOFT_DISCONNECT || reason == REMOTE_DROP_REASON {
                    // Soft disconnect: a replacement transport is expected,
                    // so the peer stays open. Outstanding requests keep
                    // their deadlines.
                    debug!(peer = %self.shared.id, code, %reason, "transport soft-disconnected");
                    self.reconnecting = true;
                    if !self.commands_open {
                        // No handle is left to install a replacement.
                        self.shutdown(close_code::ABNORMAL, "peer handle dropped", false)
                            .await;
                    }
                } else {
                    self.shutdown(code, &reason, false).await;
                }
            }
        }
    }

    fn dispatch_message(&mut self, msg: Message) {
        match msg {
            Message::Request(request) => {
                debug!(peer = %self.shared.id, id = request.id, method = %request.method, "request received");
                let incoming = IncomingRequest::new(request, self.respond_tx.clone());
                if let Err(mpsc::error::SendError(ev)) =
                    self.events_tx.send(PeerEvent::Request(incoming))
                {
                    warn!(peer = %self.shared.id, "no listener for request, dropping");
                    if let PeerEvent::Request(request) = ev {
                        request.disarm();
                    }
                }
            }
            Message::SuccessResponse(response) => match self.pending.remove(&response.id) {
                Some(pending) => {
                    let _ = pending.reply.send(Ok(response.data));
                }
                None => {
                    debug!(peer = %self.shared.id, id = response.id, "response matches no outstanding request, dropping");
                }
            },
            Message::ErrorResponse(response) => match self.pending.remove(&response.id) {
                Some(pending) => {
                    let _ = pending.reply.send(Err(RequestError::Remote {
                        code: response.error_code,
                        reason: response.error_reason,
                    }));
                }
                None => {
                    debug!(peer = %self.shared.id, id = response.id, "response matches no outstanding request, dropping");
                }
            },
            Message::Notification(notification) => {
                if self
                    .events_tx
                    .send(PeerEvent::Notification(notification))
                    .is_err()
                {
                    warn!(peer = %self.shared.id, "no listener for notification, dropping");
                }
            }
        }
    }

    /// Reject every request whose deadline has passed.
    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(peer = %self.shared.id, id, method = %pending.method, "request timed out");
                let _ = pending.reply.send(Err(RequestError::Timeout));
            }
        }
    }

    async fn handle_idle_timeout(&mut self) {
        debug!(peer = %self.shared.id, "idle timeout");
        if let Some(transport) = self.transport.as_mut() {
            transport.soft_close().await;
        }
        self.shutdown(close_code::ABNORMAL, "Timed out", true).await;
    }

    async fn swap_transport(&mut self, new: T) {
        if let Some(mut old) = self.transport.take() {
            old.soft_close().await;
        }
        self.fail_pending();

        if new.is_closed() {
            self.shutdown(close_code::ABNORMAL, "transport already closed", false)
                .await;
            return;
        }

        debug!(peer = %self.shared.id, "transport replaced");
        self.transport = Some(new);
        self.reconnecting = false;
        self.arm_idle_deadline();
    }

    /// Terminal close. Safe to call from every path; only the first call has
    /// any effect.
    async fn shutdown(&mut self, code: u16, reason: &str, close_transport: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.closed.store(true, Ordering::Release);
        self.idle_deadline = None;

        if let Some(mut transport) = self.transport.take() {
            if close_transport {
                transport.close(code, reason).await;
            }
        }

        self.fail_pending();

        debug!(peer = %self.shared.id, code, reason, "peer closed");
        let _ = self.events_tx.send(PeerEvent::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    /// Reject every outstanding request with the closed error.
    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(RequestError::Closed));
        }
    }

    /// Record inbound activity: update the observable timestamp and re-arm
    /// the idle watchdog.
    fn touch(&mut self) {
        *self
            .shared
            .last_msg_time
            .lock()
            .expect("last_msg_time poisoned") = Some(SystemTime::now());
        self.arm_idle_deadline();
    }

    fn arm_idle_deadline(&mut self) {
        if let Some(timeout) = self.options.idle_timeout {
            self.idle_deadline = Some(Instant::now() + timeout);
        }
    }
}
