//! Stream registry for listener routing
//!
//! The registry sits on top of one multiplexer. It records which
//! `(protocol, id)` pairs accept inbound streams, opens outbound streams, and
//! hands every matched inbound stream to the application.
//!
//! # Architecture
//!
//! ```text
//!                           StreamRegistry
//!                     ┌─────────────────────────┐
//!                     │ listeners: HashMap<     │
//!                     │   ListenerKey,          │
//!                     │   StreamOptions>        │
//!                     │ streams: BTreeMap<      │
//!                     │   u64, VirtualStream>   │
//!                     └───────────┬─────────────┘
//!                                 │
//!       connect() ────────────────┼─────────── PairRequest (pair task)
//!           │                     │                  │
//!           ▼                     ▼                  ▼
//!     [VirtualStream]        ChannelMux       [VirtualStream] ──► next_connection()
//!      (outbound)        (one physical pipe)     (inbound)
//! ```
//!
//! # Option precedence
//!
//! Outbound streams take per-call options over registry defaults. Inbound
//! streams take the options stored with the matching listener over registry
//! defaults. Only inbound streams are kept in the live set.

pub mod key;
pub mod store;

pub use key::ListenerKey;
pub use store::StreamRegistry;
