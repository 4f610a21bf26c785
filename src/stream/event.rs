//! Stream notifications

use crate::error::Error;

/// Notification broadcast by a virtual stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Handshake admitted
    Connect,
    /// Handshake declined; carries the cause
    Reject(Error),
    /// Transport fault; the stream is being destroyed
    Error(Error),
    /// Stream reached its terminal state
    Close,
}
