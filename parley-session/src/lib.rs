#![deny(unsafe_code)]

//! Peer engine for bidirectional message-oriented RPC.
//!
//! A [`Peer`] is the local endpoint of an RPC session. It owns exactly one
//! [`Transport`] at a time and multiplexes three message kinds over it:
//! requests (which expect one correlated response), responses, and
//! notifications. Outstanding requests live in a pending table with
//! per-request deadlines; inbound traffic is delivered to the application
//! through a [`PeerEvents`] channel.
//!
//! The engine is a single driver task: only [`Driver::run`] touches the
//! transport, handles talk to it over a command channel, and every pending
//! request settles exactly once no matter which of response arrival, deadline
//! expiry, close, or transport swap gets there first.
//!
//! # Example
//!
//! ```ignore
//! use parley_session::{Peer, PeerEvent, PeerOptions};
//!
//! let (peer, mut events, driver) = Peer::new("alice", transport, PeerOptions::default());
//! tokio::spawn(driver.run());
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             PeerEvent::Request(request) => request.accept(None),
//!             PeerEvent::Notification(n) => println!("notified: {}", n.method),
//!             PeerEvent::Pong => {}
//!             PeerEvent::Close { code, reason } => {
//!                 println!("closed: {code} {reason}");
//!                 break;
//!             }
//!         }
//!     }
//! });
//!
//! let answer = peer.request("echo", Some(serde_json::json!({"v": 1}))).await?;
//! ```

mod driver;
mod errors;
mod events;
mod peer;
mod transport;

pub use driver::Driver;
pub use errors::{NotifyError, RequestError, SwapError};
pub use events::{IncomingRequest, PeerEvent, PeerEvents};
pub use peer::{AppData, Peer, PeerOptions};
pub use transport::{Transport, TransportEvent};
