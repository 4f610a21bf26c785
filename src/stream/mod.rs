//! Virtual streams
//!
//! A virtual stream is a bidirectional, flow-controlled stream carried on one
//! logical channel of a [`ChannelMux`](crate::mux::ChannelMux). Opening one
//! exchanges handshakes; the receiving side may run an async admission
//! predicate before the stream becomes usable.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──► Pending ──Opened + admitted──► Open ──close()/Closed──► Closing
//!                │                                                    │
//!                └──declined──► Rejected ──┐          both ended ◄────┘
//!                                          ▼               │
//!                                      Destroyed ◄── inbound drained
//! ```

pub mod config;
pub mod event;
pub mod handshake;
pub mod state;
pub mod virtual_stream;

pub use config::{
    validate_protocol, StreamConfig, StreamOptions, UserData, DEFAULT_PROTOCOL,
    DEFAULT_READ_HIGH_WATER_MARK, KEY_SEPARATOR,
};
pub use event::StreamEvent;
pub use handshake::{admit_if, admit_with, BoxError, HandshakeFuture, OnHandshake, OpenLatch};
pub use state::StreamState;
pub use virtual_stream::VirtualStream;
