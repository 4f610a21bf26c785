//! Stream options and resolved configuration
//!
//! Options come in layers. Every field of [`StreamOptions`] is optional, and
//! layers are merged with [`StreamOptions::or`] in a fixed precedence:
//!
//! * outbound: per-call options, then registry defaults
//! * inbound: listener options, then registry defaults
//!
//! The merged options are then [`resolve`](StreamOptions::resolve)d into a
//! validated [`StreamConfig`], filling the remaining gaps with crate defaults.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use super::handshake::{admit_with, BoxError, OnHandshake};
use crate::codec::{Codec, Raw};
use crate::error::{Error, Result};

/// Protocol used when none is configured
pub const DEFAULT_PROTOCOL: &str = "protoplex";

/// Buffered inbound payloads above which the channel is corked
pub const DEFAULT_READ_HIGH_WATER_MARK: usize = 64;

/// Reserved byte separating protocol and id in listener keys
pub const KEY_SEPARATOR: u8 = 0;

/// Opaque application value attached to a stream
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Check that a protocol name can be used in a listener key
pub fn validate_protocol(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(Error::InvalidProtocol(protocol.to_string()));
    }
    Ok(())
}

/// One layer of stream options
pub struct StreamOptions<C: Codec = Raw, H: Codec = Raw> {
    /// Protocol name
    pub protocol: Option<String>,
    /// Stream id
    pub id: Option<Bytes>,
    /// Local handshake payload
    pub handshake: Option<H::Item>,
    /// Codec for handshake payloads
    pub handshake_codec: Option<Arc<H>>,
    /// Admission predicate run against the remote handshake
    pub on_handshake: Option<OnHandshake<H::Item>>,
    /// Codec for stream messages
    pub codec: Option<Arc<C>>,
    /// Ask the multiplexer for a unique channel
    pub unique: Option<bool>,
    /// Buffered inbound payloads above which the channel is corked
    pub read_high_water_mark: Option<usize>,
    /// Buffered inbound payloads at or below which delivery resumes
    pub read_low_water_mark: Option<usize>,
    /// Application value carried by the stream
    pub user_data: Option<UserData>,
}

impl<C: Codec, H: Codec> StreamOptions<C, H> {
    /// Create an empty options layer
    pub fn new() -> Self {
        Self {
            protocol: None,
            id: None,
            handshake: None,
            handshake_codec: None,
            on_handshake: None,
            codec: None,
            unique: None,
            read_high_water_mark: None,
            read_low_water_mark: None,
            user_data: None,
        }
    }

    /// Set the protocol name
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Set the stream id
    pub fn id(mut self, id: impl Into<Bytes>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the local handshake payload
    pub fn handshake(mut self, handshake: H::Item) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Set the handshake codec
    pub fn handshake_codec(mut self, codec: H) -> Self {
        self.handshake_codec = Some(Arc::new(codec));
        self
    }

    /// Set an async admission predicate
    pub fn on_handshake<F, Fut>(mut self, predicate: F) -> Self
    where
        F: Fn(H::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, BoxError>> + Send + 'static,
    {
        self.on_handshake = Some(admit_with(predicate));
        self
    }

    /// Set a prepared admission predicate
    pub fn admission(mut self, predicate: OnHandshake<H::Item>) -> Self {
        self.on_handshake = Some(predicate);
        self
    }

    /// Set the message codec
    pub fn codec(mut self, codec: C) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Request a unique channel
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = Some(unique);
        self
    }

    /// Set the inbound high water mark
    pub fn read_high_water_mark(mut self, payloads: usize) -> Self {
        self.read_high_water_mark = Some(payloads);
        self
    }

    /// Set the inbound low water mark
    pub fn read_low_water_mark(mut self, payloads: usize) -> Self {
        self.read_low_water_mark = Some(payloads);
        self
    }

    /// Attach an application value to streams built from these options
    pub fn user_data<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.user_data = Some(Arc::new(value));
        self
    }

    /// Fill unset fields from a lower-precedence layer
    pub fn or(self, fallback: &StreamOptions<C, H>) -> Self {
        Self {
            protocol: self.protocol.or_else(|| fallback.protocol.clone()),
            id: self.id.or_else(|| fallback.id.clone()),
            handshake: self.handshake.or_else(|| fallback.handshake.clone()),
            handshake_codec: self
                .handshake_codec
                .or_else(|| fallback.handshake_codec.clone()),
            on_handshake: self.on_handshake.or_else(|| fallback.on_handshake.clone()),
            codec: self.codec.or_else(|| fallback.codec.clone()),
            unique: self.unique.or(fallback.unique),
            read_high_water_mark: self.read_high_water_mark.or(fallback.read_high_water_mark),
            read_low_water_mark: self.read_low_water_mark.or(fallback.read_low_water_mark),
            user_data: self.user_data.or_else(|| fallback.user_data.clone()),
        }
    }

    /// Protocol name after defaults
    pub fn protocol_or_default(&self) -> &str {
        self.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL)
    }
}

impl<C, H> StreamOptions<C, H>
where
    C: Codec + Default,
    H: Codec + Default,
{
    /// Validate and fill crate defaults
    pub fn resolve(self) -> Result<StreamConfig<C, H>> {
        let protocol = self
            .protocol
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());
        validate_protocol(&protocol)?;

        // Water marks are clamped rather than rejected
        let high = self
            .read_high_water_mark
            .unwrap_or(DEFAULT_READ_HIGH_WATER_MARK)
            .max(1);
        let low = self
            .read_low_water_mark
            .unwrap_or(high / 2)
            .min(high - 1);

        Ok(StreamConfig {
            protocol,
            id: self.id.unwrap_or_default(),
            handshake: self.handshake,
            handshake_codec: self.handshake_codec.unwrap_or_default(),
            on_handshake: self.on_handshake,
            codec: self.codec.unwrap_or_default(),
            unique: self.unique.unwrap_or(false),
            read_high_water_mark: high,
            read_low_water_mark: low,
            user_data: self.user_data,
        })
    }
}

impl<C: Codec, H: Codec> Default for StreamOptions<C, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec, H: Codec> Clone for StreamOptions<C, H> {
    fn clone(&self) -> Self {
        Self::new().or(self)
    }
}

impl<C: Codec, H: Codec> fmt::Debug for StreamOptions<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("protocol", &self.protocol)
            .field("id", &self.id)
            .field("has_handshake", &self.handshake.is_some())
            .field("has_on_handshake", &self.on_handshake.is_some())
            .field("unique", &self.unique)
            .field("read_high_water_mark", &self.read_high_water_mark)
            .field("read_low_water_mark", &self.read_low_water_mark)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Fully resolved configuration for one stream
pub struct StreamConfig<C: Codec = Raw, H: Codec = Raw> {
    /// Protocol name
    pub protocol: String,
    /// Stream id, empty when absent
    pub id: Bytes,
    /// Local handshake payload; an empty payload is sent when unset
    pub handshake: Option<H::Item>,
    /// Codec for handshake payloads
    pub handshake_codec: Arc<H>,
    /// Admission predicate; every handshake is admitted when unset
    pub on_handshake: Option<OnHandshake<H::Item>>,
    /// Codec for stream messages
    pub codec: Arc<C>,
    /// Ask the multiplexer for a unique channel
    pub unique: bool,
    /// Buffered inbound payloads above which the channel is corked
    pub read_high_water_mark: usize,
    /// Buffered inbound payloads at or below which delivery resumes
    pub read_low_water_mark: usize,
    /// Application value carried by the stream
    pub user_data: Option<UserData>,
}

impl<C: Codec, H: Codec> fmt::Debug for StreamConfig<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("protocol", &self.protocol)
            .field("id", &self.id)
            .field("unique", &self.unique)
            .field("read_high_water_mark", &self.read_high_water_mark)
            .field("read_low_water_mark", &self.read_low_water_mark)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Utf8;

    type Options = StreamOptions<Raw, Raw>;

    #[test]
    fn test_default_config() {
        let config = Options::new().resolve().unwrap();

        assert_eq!(config.protocol, DEFAULT_PROTOCOL);
        assert!(config.id.is_empty());
        assert!(config.handshake.is_none());
        assert!(config.on_handshake.is_none());
        assert!(!config.unique);
        assert_eq!(config.read_high_water_mark, DEFAULT_READ_HIGH_WATER_MARK);
        assert_eq!(config.read_low_water_mark, DEFAULT_READ_HIGH_WATER_MARK / 2);
    }

    #[test]
    fn test_precedence() {
        let defaults = Options::new()
            .protocol("registry-proto")
            .id(Bytes::from_static(b"default-id"))
            .unique(true)
            .read_high_water_mark(8);
        let per_call = Options::new().protocol("call-proto").unique(false);

        let config = per_call.or(&defaults).resolve().unwrap();

        assert_eq!(config.protocol, "call-proto");
        assert_eq!(&config.id[..], b"default-id");
        assert!(!config.unique);
        assert_eq!(config.read_high_water_mark, 8);
    }

    #[test]
    fn test_water_marks_clamped() {
        let config = Options::new()
            .read_high_water_mark(0)
            .read_low_water_mark(10)
            .resolve()
            .unwrap();

        assert_eq!(config.read_high_water_mark, 1);
        assert_eq!(config.read_low_water_mark, 0);
    }

    #[test]
    fn test_invalid_protocol() {
        assert!(matches!(
            Options::new().protocol("").resolve(),
            Err(Error::InvalidProtocol(_))
        ));
        assert!(matches!(
            Options::new().protocol("bad\0name").resolve(),
            Err(Error::InvalidProtocol(_))
        ));
        assert!(validate_protocol("custom-proto1").is_ok());
    }

    #[test]
    fn test_typed_handshake_layers() {
        let defaults = StreamOptions::<Raw, Utf8>::new().handshake("from-defaults".to_string());
        let merged = StreamOptions::<Raw, Utf8>::new().or(&defaults);

        assert_eq!(merged.handshake.as_deref(), Some("from-defaults"));
        assert_eq!(merged.protocol_or_default(), DEFAULT_PROTOCOL);
    }

    #[test]
    fn test_user_data_layers() {
        let defaults = Options::new().user_data(7u32);
        let config = Options::new().or(&defaults).resolve().unwrap();
        let value = config.user_data.unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 7);

        let config = Options::new()
            .user_data("listener")
            .or(&defaults)
            .resolve()
            .unwrap();
        assert!(config.user_data.unwrap().downcast::<&'static str>().is_ok());
    }

    #[test]
    fn test_clone_keeps_predicate() {
        let options = Options::new().on_handshake(|_| async { Ok(false) });
        let copy = options.clone();
        assert!(copy.on_handshake.is_some());
    }
}
