use std::io;

/// Error from an outgoing request.
#[derive(Debug)]
pub enum RequestError {
    /// The transport refused or failed the send. No pending entry was
    /// registered; the request never left this peer.
    Send(io::Error),

    /// The remote answered with an error response.
    Remote { code: i32, reason: String },

    /// No response arrived before the request deadline.
    Timeout,

    /// The peer or its transport was closed or swapped while the request was
    /// outstanding.
    Closed,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Send(e) => write!(f, "send failed: {e}"),
            RequestError::Remote { code, reason } => {
                write!(f, "request failed with code {code}: {reason}")
            }
            RequestError::Timeout => write!(f, "request timeout"),
            RequestError::Closed => write!(f, "peer closed"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Send(e) => Some(e),
            _ => None,
        }
    }
}

/// Error from an outgoing notification.
#[derive(Debug)]
pub enum NotifyError {
    /// The transport refused or failed the send.
    Send(io::Error),

    /// The peer is closed.
    Closed,
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Send(e) => write!(f, "send failed: {e}"),
            NotifyError::Closed => write!(f, "peer closed"),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Send(e) => Some(e),
            _ => None,
        }
    }
}

/// Error from a transport swap.
#[derive(Debug)]
pub enum SwapError {
    /// The peer is closed; the replacement transport was not installed.
    Closed,
}

impl std::fmt::Display for SwapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapError::Closed => write!(f, "peer closed"),
        }
    }
}

impl std::error::Error for SwapError {}
