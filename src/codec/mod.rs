//! Payload codecs
//!
//! Channels move opaque bytes. A [`Codec`] turns those bytes into the values
//! an application reads and writes, for both handshake payloads and stream
//! messages. [`Raw`] is the default and passes bytes through unchanged.

pub mod json;

use bytes::Bytes;

use crate::error::CodecError;

pub use json::Json;

/// Encodes and decodes a single logical payload
pub trait Codec: Send + Sync + 'static {
    /// Value type carried by this codec
    type Item: Clone + Send + Sync + 'static;

    /// Encode one value into a channel message
    fn encode(&self, item: &Self::Item) -> Result<Bytes, CodecError>;

    /// Decode one channel message into a value
    fn decode(&self, bytes: Bytes) -> Result<Self::Item, CodecError>;

    /// Value carried by an empty batch, if this codec has one
    ///
    /// A zero-length write arrives as exactly this value. Codecs returning
    /// `None` refuse zero-length writes at the sender.
    fn empty(&self) -> Option<Self::Item> {
        self.decode(Bytes::new()).ok()
    }
}

/// Pass-through codec for raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Codec for Raw {
    type Item = Bytes;

    fn encode(&self, item: &Bytes) -> Result<Bytes, CodecError> {
        // Reference-counted clone, no copy
        Ok(item.clone())
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes, CodecError> {
        Ok(bytes)
    }

    fn empty(&self) -> Option<Bytes> {
        Some(Bytes::new())
    }
}

/// UTF-8 string codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Codec for Utf8 {
    type Item = String;

    fn encode(&self, item: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(item.as_bytes()))
    }

    fn decode(&self, bytes: Bytes) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn empty(&self) -> Option<String> {
        Some(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_identity() {
        let data = Bytes::from_static(b"\x00\x01payload");
        let encoded = Raw.encode(&data).unwrap();
        assert_eq!(encoded, data);
        assert_eq!(Raw.decode(encoded).unwrap(), data);
    }

    #[test]
    fn test_raw_empty() {
        assert!(Raw.decode(Bytes::new()).unwrap().is_empty());
        assert_eq!(Raw.empty(), Some(Bytes::new()));
        assert_eq!(Utf8.empty().as_deref(), Some(""));
    }

    #[test]
    fn test_utf8_rejects_invalid() {
        let result = Utf8.decode(Bytes::from_static(&[0xff, 0xfe]));
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_utf8_text() {
        let encoded = Utf8.encode(&"héllo".to_string()).unwrap();
        assert_eq!(&encoded[..], "héllo".as_bytes());
        assert_eq!(Utf8.decode(encoded).unwrap(), "héllo");
    }
}
