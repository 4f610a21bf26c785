//! Channel multiplexer contract
//!
//! The virtual-stream layer never touches the physical transport itself. It
//! relies on a [`ChannelMux`] that frames and moves discrete message batches
//! over one connection and reports per-channel lifecycle events.
//!
//! ```text
//!   VirtualStream ──open/send/close/cork──►  Channel  ─┐
//!        ▲                                            │  ChannelMux
//!        └──────────── ChannelEvents ◄────────────────┘  (one physical pipe)
//! ```
//!
//! Channels are byte oriented: codecs are applied by the stream, not here.
//! [`MemoryMux`] is an in-process implementation joining two endpoints.

pub mod memory;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::MuxError;

pub use memory::{MemoryMux, MemoryMuxConfig};

/// Lifecycle and data events raised by a channel, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Both sides opened the channel; carries the peer's encoded handshake
    Opened(Bytes),
    /// A batch of zero or more messages from the peer
    Message(Vec<Bytes>),
    /// Outbound buffer space freed after a saturated send
    Drained,
    /// The peer will send nothing more on this channel
    Closed,
    /// The channel was torn down
    Destroyed,
}

/// Receiving half of a channel's event queue
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Parameters for creating a named channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Protocol name
    pub protocol: String,
    /// Channel id (empty when absent)
    pub id: Bytes,
    /// Refuse creation if a channel with this protocol and id already exists
    pub unique: bool,
}

/// Notification that an inbound channel matched a paired `(protocol, id)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRequest {
    /// Protocol name
    pub protocol: String,
    /// Channel id (empty when absent)
    pub id: Bytes,
}

/// Handle to one logical channel
pub trait Channel: Send + Sync {
    /// Send the local handshake, opening the channel
    fn open(&self, handshake: Bytes) -> Result<(), MuxError>;

    /// Hand a batch to the outbound buffer
    ///
    /// Returns `Ok(false)` when the buffer is saturated. The batch is still
    /// queued; a [`ChannelEvent::Drained`] follows once space frees.
    fn send(&self, batch: Vec<Bytes>) -> Result<bool, MuxError>;

    /// Stop sending on this channel (half-close)
    fn close(&self);

    /// Tear the channel down. Never affects the physical transport.
    fn destroy(&self);

    /// Pause delivery of inbound batches
    fn cork(&self);

    /// Resume delivery of inbound batches
    fn uncork(&self);

    /// Whether both sides have opened
    fn is_opened(&self) -> bool;
}

/// A multiplexer owning one physical transport
pub trait ChannelMux: Send + Sync + 'static {
    /// Create a named logical channel and its event queue
    fn create_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<(Box<dyn Channel>, ChannelEvents), MuxError>;

    /// Notify `notify` whenever an inbound channel matches `(protocol, id)`
    fn pair(&self, protocol: &str, id: &Bytes, notify: mpsc::UnboundedSender<PairRequest>);

    /// Stop notifying for `(protocol, id)`
    fn unpair(&self, protocol: &str, id: &Bytes);

    /// Whether the physical transport is gone
    fn is_destroyed(&self) -> bool;
}
