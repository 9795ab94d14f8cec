//! Error types for the gateway session engine.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for session operations.
///
/// Errors are cheap to clone so that one failed connection attempt can reject
/// every caller that joined it.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Errors while encoding a request or decoding a payload.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The gateway rejected the configured password.
    #[error("Gateway refused the login")]
    LoginRefused,

    /// A request was issued while no session was established.
    #[error("Session is not connected")]
    NotConnected,

    /// The session configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The session task is gone.
    #[error("Channel closed")]
    ChannelClosed,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Connection-specific errors.
#[derive(Clone, Debug, Error)]
pub enum ConnectionError {
    /// Failed to open the TCP connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The client certificate or key could not be loaded.
    #[error("Invalid client identity: {0}")]
    InvalidIdentity(String),

    /// Connection closed before the session was established.
    #[error("Connection closed unexpectedly")]
    Closed,

    /// Connection is shutting down.
    #[error("Connection is shutting down")]
    ShuttingDown,
}

/// Protocol-level errors.
///
/// These are reported per frame and never tear the session down.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The envelope is too short to carry a header and checksum.
    #[error("Envelope of {0} bytes is too short")]
    Truncated(usize),

    /// The length byte disagrees with the envelope size.
    #[error("Length byte says {declared}, envelope carries {actual}")]
    LengthMismatch {
        /// Value of the length byte.
        declared: usize,
        /// Envelope length minus two.
        actual: usize,
    },

    /// Checksum mismatch.
    #[error("Checksum mismatch: expected {expected:02x}, got {actual:02x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte carried by the envelope.
        actual: u8,
    },

    /// The transport framing was malformed.
    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),
}

/// Errors raised by the transport framing layer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// An escape byte was followed by an unexpected value.
    #[error("Invalid escape sequence: 0xdb {0:#04x}")]
    InvalidEscape(u8),

    /// The frame ended in the middle of an escape sequence.
    #[error("Frame ends inside an escape sequence")]
    TruncatedEscape,

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Codec-related errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// No opcode is registered under this name.
    #[error("Unknown opcode name: {0}")]
    UnknownName(String),

    /// No name is registered for this opcode.
    #[error("Unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// The opcode has no payload encoder, so it cannot be sent.
    #[error("No payload encoder registered for {0}")]
    MissingEncoder(&'static str),

    /// Only `_REQ` opcodes can be issued as requests.
    #[error("{0} is not a request opcode")]
    NotARequest(&'static str),

    /// A payload field required by the encoder is absent.
    #[error("{opcode} requires field `{field}`")]
    MissingField {
        /// Opcode being encoded.
        opcode: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A payload field has the wrong type or range.
    #[error("Invalid field `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The payload does not fit the one-byte length field.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Size of the payload.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The payload is shorter than the opcode's layout.
    #[error("{opcode} payload needs {expected} bytes, got {actual}")]
    ShortPayload {
        /// Opcode being decoded.
        opcode: &'static str,
        /// Bytes the layout needs.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },
}
