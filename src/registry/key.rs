//! Listener keys

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::stream::{validate_protocol, KEY_SEPARATOR};

/// Key identifying a `(protocol, id)` listener
///
/// Encoded as the protocol bytes, the reserved separator, then the id bytes.
/// Protocol names never contain the separator, so distinct pairs always give
/// distinct keys. An absent id and an empty id give the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey(Bytes);

impl ListenerKey {
    /// Build the key for a protocol and optional id
    pub fn new(protocol: &str, id: Option<&Bytes>) -> Result<Self> {
        validate_protocol(protocol)?;

        let id = id.map(|id| &id[..]).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(protocol.len() + 1 + id.len());
        buf.put_slice(protocol.as_bytes());
        buf.put_u8(KEY_SEPARATOR);
        buf.put_slice(id);

        Ok(Self(buf.freeze()))
    }

    /// Encoded key bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl std::fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let split = self
            .0
            .iter()
            .position(|b| *b == KEY_SEPARATOR)
            .unwrap_or(self.0.len());
        let (protocol, id) = self.0.split_at(split);
        let id = id.get(1..).unwrap_or_default();

        write!(f, "{}", String::from_utf8_lossy(protocol))?;
        if !id.is_empty() {
            write!(f, "/{}", String::from_utf8_lossy(id))?;
        }
        Ok(())
    }
}
