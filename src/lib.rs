//! Flow-controlled virtual streams over a channel multiplexer
//!
//! One physical duplex connection carries many independent, bidirectional
//! virtual streams. Each stream is addressed by a protocol name and an
//! optional binary id, opens with an exchange of handshake payloads that the
//! receiving side may accept or reject asynchronously, and propagates
//! backpressure end to end.
//!
//! ```text
//!   Application ──listen/connect──► StreamRegistry ──► VirtualStream ─┐
//!        ▲                              │                             │
//!        └──── next_connection() ◄──────┘       ChannelMux ◄─────────┘
//!                                            (one physical pipe)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use protoplex_rs::mux::MemoryMux;
//! use protoplex_rs::{StreamOptions, StreamRegistry};
//!
//! # async fn run() -> protoplex_rs::Result<()> {
//! let (a, b) = MemoryMux::pair();
//! let client: StreamRegistry<MemoryMux> = StreamRegistry::new(a, StreamOptions::new())?;
//! let server: StreamRegistry<MemoryMux> = StreamRegistry::new(b, StreamOptions::new())?;
//!
//! server.listen(None, StreamOptions::new())?;
//!
//! let stream = client.connect(None, StreamOptions::new())?;
//! stream.write_one(Bytes::from_static(b"Hello, World!")).await?;
//! stream.close().await?;
//!
//! if let Some(inbound) = server.next_connection().await {
//!     while let Some(payload) = inbound.read().await? {
//!         println!("received {:?}", payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod mux;
pub mod registry;
pub mod stream;

pub use codec::{Codec, Json, Raw, Utf8};
pub use error::{Error, Result};
pub use registry::StreamRegistry;
pub use stream::{StreamEvent, StreamOptions, StreamState, VirtualStream};
