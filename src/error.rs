//! Error types
//!
//! A single crate-wide [`Error`] covers every outcome a stream or registry
//! operation can report. It is `Clone` so that one outcome (for example the
//! result of a handshake) can be handed to any number of waiters.

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by a channel multiplexer binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The physical transport behind the multiplexer is gone
    TransportDestroyed,
    /// A unique channel already exists for this protocol and id
    DuplicateChannel {
        /// Protocol name of the conflicting channel
        protocol: String,
    },
    /// The channel has not been opened by both sides yet
    NotOpened,
    /// The channel has already been closed for sending
    ChannelClosed,
}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxError::TransportDestroyed => write!(f, "Transport destroyed"),
            MuxError::DuplicateChannel { protocol } => {
                write!(f, "Unique channel already exists for protocol {}", protocol)
            }
            MuxError::NotOpened => write!(f, "Channel not opened"),
            MuxError::ChannelClosed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for MuxError {}

/// Errors raised while encoding or decoding a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Value could not be encoded
    Encode(String),
    /// Bytes could not be decoded
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "Encode failed: {}", msg),
            CodecError::Decode(msg) => write!(f, "Decode failed: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Crate error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The admission predicate declined the remote handshake
    Rejected(String),
    /// The admission predicate failed while deciding
    Handshake(String),
    /// The channel failed underneath the stream
    Transport(String),
    /// A payload could not be encoded or decoded
    Codec(CodecError),
    /// The multiplexer binding refused the operation
    Mux(MuxError),
    /// Protocol name is empty or contains the reserved key separator
    InvalidProtocol(String),
    /// The stream was destroyed
    Destroyed,
    /// The stream was already closed for writing
    WriteAfterClose,
}

impl Error {
    /// Whether this error is an admission outcome rather than a fault
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected(_) | Error::Handshake(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Rejected(reason) => write!(f, "Connection rejected: {}", reason),
            Error::Handshake(reason) => write!(f, "Handshake failed: {}", reason),
            Error::Transport(reason) => write!(f, "Transport error: {}", reason),
            Error::Codec(e) => write!(f, "Codec error: {}", e),
            Error::Mux(e) => write!(f, "Multiplexer error: {}", e),
            Error::InvalidProtocol(name) => write!(f, "Invalid protocol name: {:?}", name),
            Error::Destroyed => write!(f, "Stream was destroyed"),
            Error::WriteAfterClose => write!(f, "Write after stream was closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Codec(e) => Some(e),
            Error::Mux(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<MuxError> for Error {
    fn from(e: MuxError) -> Self {
        Error::Mux(e)
    }
}
