//! Domain-specific error types for the ORB protocol.
//!
//! All fallible operations return `Result<T, OrbError>`.
//! No panics on invalid input — every error is typed and recoverable,
//! and each category maps onto the wire-level reply taxonomy.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the ORB protocol.
#[derive(Debug, Error)]
pub enum OrbError {
    // ── Protocol / marshal errors ────────────────────────────────
    /// Received bytes that do not start with the ORB magic sequence.
    #[error("invalid magic bytes: expected ORB1")]
    InvalidMagic,

    /// A field in the message header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedProtocol { major: u8, minor: u8 },

    /// The encoding version of an encapsulation is not supported.
    #[error("unsupported encoding version: {major}.{minor}")]
    UnsupportedEncoding { major: u8, minor: u8 },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// Stream decoding failed; the current request is unrecoverable.
    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Compressed body could not be inflated or deflated.
    #[error("compression error: {0}")]
    Compression(String),

    // ── Dispatch errors ──────────────────────────────────────────
    /// No servant is registered under the requested identity.
    #[error("object not exist: {identity}")]
    ObjectNotExist { identity: String },

    /// The identity exists, but not under the requested facet.
    #[error("facet not exist: {identity} facet \"{facet}\"")]
    FacetNotExist { identity: String, facet: String },

    /// The servant does not implement the named operation.
    #[error("operation not exist: {identity} operation \"{operation}\"")]
    OperationNotExist { identity: String, operation: String },

    /// A servant is already registered under this identity and facet.
    #[error("servant already registered: {identity} facet \"{facet}\"")]
    ServantAlreadyRegistered { identity: String, facet: String },

    /// Caller and servant disagree about the operation mode.
    #[error("operation mode mismatch for \"{operation}\": declared {declared}, called {called}")]
    OperationModeMismatch {
        operation: String,
        declared: &'static str,
        called: &'static str,
    },

    /// The peer replied with a user exception body.
    #[error("user exception")]
    UserException,

    /// The peer replied with an unknown local/user/system exception.
    #[error("unknown exception from peer: {0}")]
    UnknownException(String),

    // ── Transport errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection lost")]
    ConnectionLost,

    /// An mpsc/oneshot channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// An endpoint string could not be parsed.
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: &'static str },

    /// The proxy tunnel (CONNECT/SOCKS) was refused.
    #[error("proxy tunnel failed: {0}")]
    ProxyTunnel(String),

    // ── Security errors ──────────────────────────────────────────
    /// TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    HandshakeFailed(String),

    /// The application-supplied certificate verifier rejected the peer.
    #[error("peer certificate rejected by verifier")]
    PeerRejected,

    /// TLS configuration could not be assembled.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    /// An identity string could not be parsed.
    #[error("invalid identity string: {0}")]
    InvalidIdentity(String),
}

// ── MarshalError ─────────────────────────────────────────────────

/// Typed error for stream encoding and decoding failures.
///
/// Marshal errors are fatal to the current request. When detected
/// mid-stream on a live connection the framing can no longer be
/// trusted and the connection is closed.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// A read ran past the end of the buffer or encapsulation.
    #[error("unexpected end of buffer: need {needed} bytes, {remaining} remaining")]
    EndOfBuffer { needed: usize, remaining: usize },

    /// A declared sequence length cannot fit in the remaining bytes.
    #[error("sequence length {declared} exceeds remaining buffer capacity")]
    SequenceTooLong { declared: usize },

    /// A size field held an out-of-range value.
    #[error("invalid size value")]
    InvalidSize,

    /// String bytes were not valid UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Encapsulation framing was inconsistent.
    #[error("invalid encapsulation: {0}")]
    InvalidEncapsulation(&'static str),

    /// Slice framing was inconsistent (missing last-slice flag, size
    /// mismatch, bad indirection entry).
    #[error("invalid slice framing: {0}")]
    InvalidSlice(&'static str),

    /// A value back-reference pointed outside the instance table.
    #[error("invalid value reference: {0}")]
    InvalidValueReference(usize),

    /// No factory matched the wire type id and slicing was disabled.
    #[error("no value factory for type id \"{0}\"")]
    NoValueFactory(String),

    /// The requested feature needs a newer encoding version.
    ///
    /// Encoding 1.0 cannot carry class instances or preserve unknown
    /// slices; this is an explicit capability gate, not a silent drop.
    #[error("operation not supported by encoding {major}.{minor}: {what}")]
    NotSupportedByEncoding { major: u8, minor: u8, what: &'static str },

    /// `end_encapsulation` was called with unread bytes left over.
    #[error("encapsulation has {0} unconsumed bytes")]
    UnconsumedBytes(usize),

    /// Stream API misuse (unbalanced start/end calls).
    #[error("stream misuse: {0}")]
    StreamMisuse(&'static str),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for OrbError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        OrbError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for OrbError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        OrbError::ChannelClosed
    }
}

impl From<rustls::Error> for OrbError {
    fn from(e: rustls::Error) -> Self {
        OrbError::HandshakeFailed(e.to_string())
    }
}

impl OrbError {
    /// True when a retry of the failed invocation is known to be safe:
    /// nothing was handed to the network yet.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            OrbError::InvalidEndpoint { .. }
                | OrbError::ChannelClosed
                | OrbError::ObjectNotExist { .. }
                | OrbError::FacetNotExist { .. }
                | OrbError::OperationNotExist { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = OrbError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = OrbError::FrameTooLarge { size: 1000, max: 500 };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn marshal_error_wraps() {
        let e: OrbError = MarshalError::InvalidSize.into();
        assert!(matches!(e, OrbError::Marshal(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: OrbError = io_err.into();
        assert!(matches!(e, OrbError::Connection(_)));
    }

    #[test]
    fn encoding_gate_names_versions() {
        let e = MarshalError::NotSupportedByEncoding {
            major: 1,
            minor: 0,
            what: "class instances",
        };
        let s = e.to_string();
        assert!(s.contains("1.0"));
        assert!(s.contains("class instances"));
    }
}
