use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::driver::{Driver, DriverCommand};
use crate::errors::{NotifyError, RequestError, SwapError};
use crate::events::PeerEvents;
use crate::transport::Transport;
use parley_wire::close_code;

/// Default reason sent with [`Peer::close`].
const NORMAL_CLOSE_REASON: &str = "Normal close by server";

/// Tuning knobs for a peer.
///
/// The request deadline for a new request is
/// `request_timeout_base · (request_timeout_scale +
/// request_timeout_load_factor · pending)`, where `pending` is the number of
/// requests already outstanding at registration time. With the defaults that
/// is 30 s for an idle peer and grows by 200 ms per outstanding request,
/// which gives natural backpressure under high in-flight counts. The deadline
/// is fixed at registration and does not shrink if the table drains.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Inactivity watchdog. When set, every inbound message or pong re-arms
    /// it; firing soft-closes the transport and closes the peer with code
    /// 1006.
    pub idle_timeout: Option<Duration>,

    /// Base unit of the request deadline formula.
    pub request_timeout_base: Duration,

    /// Constant term of the request deadline formula.
    pub request_timeout_scale: f64,

    /// Per-outstanding-request term of the request deadline formula.
    pub request_timeout_load_factor: f64,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            request_timeout_base: Duration::from_secs(2),
            request_timeout_scale: 15.0,
            request_timeout_load_factor: 0.1,
        }
    }
}

impl PeerOptions {
    /// Deadline for a request registered while `pending` requests are
    /// already outstanding.
    pub(crate) fn request_timeout(&self, pending: usize) -> Duration {
        self.request_timeout_base
            .mul_f64(self.request_timeout_scale + self.request_timeout_load_factor * pending as f64)
    }
}

/// Application-owned attributes attached to a peer.
///
/// The engine never inspects the contents. The container itself cannot be
/// replaced: attributes are mutable through this handle, but the bag keeps
/// its identity for the peer's whole lifetime, including across transport
/// swaps.
#[derive(Debug, Default)]
pub struct AppData {
    attributes: Mutex<HashMap<String, Value>>,
}

impl AppData {
    /// Look up an attribute.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.attributes.lock().expect("attributes poisoned").get(key).cloned()
    }

    /// Set an attribute, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes
            .lock()
            .expect("attributes poisoned")
            .insert(key.into(), value)
    }

    /// Remove an attribute.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.attributes.lock().expect("attributes poisoned").remove(key)
    }

    /// Whether an attribute is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.attributes.lock().expect("attributes poisoned").contains_key(key)
    }
}

/// State shared between peer handles and the driver.
pub(crate) struct PeerShared {
    pub(crate) id: String,
    pub(crate) closed: AtomicBool,
    pub(crate) data: AppData,
    pub(crate) last_msg_time: Mutex<Option<SystemTime>>,
}

/// The local endpoint of an RPC session.
///
/// A `Peer` is a cheap-clone handle onto a [`Driver`] task that owns the
/// transport. All clones address the same peer; the peer's `id` and [`AppData`]
/// survive any number of transport swaps.
pub struct Peer<T: Transport> {
    shared: Arc<PeerShared>,
    command_tx: mpsc::UnboundedSender<DriverCommand<T>>,
}

impl<T: Transport> Clone for Peer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            command_tx: self.command_tx.clone(),
        }
    }
}

impl<T: Transport> Peer<T> {
    /// Create a peer attached to `transport`.
    ///
    /// Returns the handle, the event stream, and the driver. The driver must
    /// be spawned for the peer to make progress:
    ///
    /// ```ignore
    /// let (peer, events, driver) = Peer::new("alice", transport, PeerOptions::default());
    /// tokio::spawn(driver.run());
    /// ```
    pub fn new(
        id: impl Into<String>,
        transport: T,
        options: PeerOptions,
    ) -> (Peer<T>, PeerEvents, Driver<T>) {
        let shared = Arc::new(PeerShared {
            id: id.into(),
            closed: AtomicBool::new(false),
            data: AppData::default(),
            last_msg_time: Mutex::new(None),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(shared.clone(), options, transport, command_rx, events_tx);
        let peer = Peer { shared, command_tx };

        (peer, PeerEvents::new(events_rx), driver)
    }

    /// The host-assigned peer id. Immutable for the peer's lifetime.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether the peer has closed. Closing is terminal.
    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// The application-owned attribute bag.
    pub fn data(&self) -> &AppData {
        &self.shared.data
    }

    /// Wall-clock time of the last inbound frame or pong.
    pub fn last_msg_time(&self) -> Option<SystemTime> {
        *self.shared.last_msg_time.lock().expect("last_msg_time poisoned")
    }

    /// Send a request and wait for the correlated response.
    ///
    /// Resolves with the response payload, or fails with the remote error,
    /// a deadline expiry, a send failure, or [`RequestError::Closed`] when
    /// the peer or its transport goes away first.
    ///
    /// While the peer is between transports (soft-disconnected, waiting for
    /// [`set_new_transport`](Peer::set_new_transport)) the request resolves
    /// immediately with `Ok(None)` without being sent.
    pub async fn request(
        &self,
        method: &str,
        data: Option<Value>,
    ) -> Result<Option<Value>, RequestError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::Request {
                method: method.to_owned(),
                data,
                reply: reply_tx,
            })
            .map_err(|_| RequestError::Closed)?;
        reply_rx.await.map_err(|_| RequestError::Closed)?
    }

    /// Send a notification. No registration, no reply.
    ///
    /// Like [`request`](Peer::request), a notification issued while the peer
    /// is between transports resolves with `Ok(())` without being sent.
    pub async fn notify(&self, method: &str, data: Option<Value>) -> Result<(), NotifyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::Notify {
                method: method.to_owned(),
                data,
                reply: reply_tx,
            })
            .map_err(|_| NotifyError::Closed)?;
        reply_rx.await.map_err(|_| NotifyError::Closed)?
    }

    /// Close the peer with code 4000 and the default reason.
    ///
    /// Idempotent: closing an already-closed peer does nothing.
    pub async fn close(&self) {
        self.close_with(close_code::NORMAL, NORMAL_CLOSE_REASON).await;
    }

    /// Close the peer with an explicit code and reason.
    ///
    /// Closes the transport, rejects every outstanding request with
    /// [`RequestError::Closed`], and emits the `Close` event once.
    pub async fn close_with(&self, code: u16, reason: &str) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(DriverCommand::Close {
                code,
                reason: reason.to_owned(),
                done: done_tx,
            })
            .is_ok()
        {
            // A dropped ack means another close won the race; same outcome.
            let _ = done_rx.await;
        }
    }

    /// Replace the current transport.
    ///
    /// Soft-closes the old transport, rejects every outstanding request with
    /// [`RequestError::Closed`], and attaches the replacement. The peer's
    /// id, attributes, and event subscribers are untouched, and no `Close`
    /// event is emitted.
    pub async fn set_new_transport(&self, transport: T) -> Result<(), SwapError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::SetTransport {
                transport,
                done: done_tx,
            })
            .map_err(|_| SwapError::Closed)?;
        done_rx.await.map_err(|_| SwapError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_timeout_boundary_values() {
        let options = PeerOptions::default();
        assert_eq!(options.request_timeout(0), Duration::from_millis(30_000));
        assert_eq!(options.request_timeout(100), Duration::from_millis(50_000));
    }

    #[test]
    fn request_timeout_uses_configured_constants() {
        let options = PeerOptions {
            request_timeout_base: Duration::from_millis(100),
            request_timeout_scale: 1.0,
            request_timeout_load_factor: 0.5,
            ..PeerOptions::default()
        };
        assert_eq!(options.request_timeout(0), Duration::from_millis(100));
        assert_eq!(options.request_timeout(4), Duration::from_millis(300));
    }

    #[test]
    fn app_data_attributes_are_mutable() {
        let data = AppData::default();
        assert_eq!(data.get("k"), None);
        assert_eq!(data.insert("k", serde_json::json!(1)), None);
        assert_eq!(data.insert("k", serde_json::json!(2)), Some(serde_json::json!(1)));
        assert!(data.contains_key("k"));
        assert_eq!(data.remove("k"), Some(serde_json::json!(2)));
        assert!(!data.contains_key("k"));
    }
}
