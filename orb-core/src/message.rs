//! Protocol message classification enums.
//!
//! Uses proper enums with `TryFrom` — no panics on unknown values.

use crate::error::OrbError;
use std::fmt;

// ── MessageType ──────────────────────────────────────────────────

/// The five message kinds that can follow an ORB header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A two-way or oneway invocation.
    Request = 0x0,
    /// A batch of oneway invocations sent as one message.
    BatchRequest = 0x1,
    /// The reply to a two-way request.
    Reply = 0x2,
    /// Server-to-client greeting that opens a connection.
    ValidateConnection = 0x3,
    /// Graceful shutdown notice; no further requests are accepted.
    CloseConnection = 0x4,
}

impl TryFrom<u8> for MessageType {
    type Error = OrbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(MessageType::Request),
            0x1 => Ok(MessageType::BatchRequest),
            0x2 => Ok(MessageType::Reply),
            0x3 => Ok(MessageType::ValidateConnection),
            0x4 => Ok(MessageType::CloseConnection),
            _ => Err(OrbError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── ReplyStatus ──────────────────────────────────────────────────

/// Outcome discriminant carried by every reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// The operation completed; the body holds its results.
    Ok = 0x0,
    /// The operation raised a declared user exception.
    UserException = 0x1,
    /// No servant under the requested identity.
    ObjectNotExist = 0x2,
    /// The identity exists but not the requested facet.
    FacetNotExist = 0x3,
    /// The servant does not implement the operation.
    OperationNotExist = 0x4,
    /// The dispatch failed with an undeclared local error.
    UnknownLocalException = 0x5,
    /// The dispatch raised an exception outside the declared set.
    UnknownUserException = 0x6,
    /// The dispatch failed in a way the server cannot classify.
    UnknownException = 0x7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = OrbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(ReplyStatus::Ok),
            0x1 => Ok(ReplyStatus::UserException),
            0x2 => Ok(ReplyStatus::ObjectNotExist),
            0x3 => Ok(ReplyStatus::FacetNotExist),
            0x4 => Ok(ReplyStatus::OperationNotExist),
            0x5 => Ok(ReplyStatus::UnknownLocalException),
            0x6 => Ok(ReplyStatus::UnknownUserException),
            0x7 => Ok(ReplyStatus::UnknownException),
            _ => Err(OrbError::UnknownVariant {
                type_name: "ReplyStatus",
                value: value as u64,
            }),
        }
    }
}

impl ReplyStatus {
    /// Statuses whose body is a full reply encapsulation rather than
    /// the fixed not-exist / exception-string layout.
    pub fn has_encapsulation(&self) -> bool {
        matches!(self, ReplyStatus::Ok | ReplyStatus::UserException)
    }

    /// Statuses that identify a missing dispatch target.
    pub fn is_not_exist(&self) -> bool {
        matches!(
            self,
            ReplyStatus::ObjectNotExist | ReplyStatus::FacetNotExist | ReplyStatus::OperationNotExist
        )
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── OperationMode ────────────────────────────────────────────────

/// How an operation interacts with object state, as declared by the
/// servant and as flagged by the caller.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    /// May mutate state; never retried automatically.
    Normal = 0x0,
    /// Guaranteed not to mutate state.
    Nonmutating = 0x1,
    /// May mutate state, but re-execution is harmless.
    Idempotent = 0x2,
}

impl TryFrom<u8> for OperationMode {
    type Error = OrbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OperationMode::Normal),
            0x1 => Ok(OperationMode::Nonmutating),
            0x2 => Ok(OperationMode::Idempotent),
            _ => Err(OrbError::UnknownVariant {
                type_name: "OperationMode",
                value: value as u64,
            }),
        }
    }
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Normal => "normal",
            OperationMode::Nonmutating => "nonmutating",
            OperationMode::Idempotent => "idempotent",
        }
    }

    /// Whether a call flagged `called` is acceptable against an
    /// operation declared with mode `self`.
    ///
    /// Exact matches always pass. The one tolerated mismatch is a
    /// nonmutating-flagged call on an idempotent-declared operation:
    /// older callers conflate the two and the stronger guarantee
    /// subsumes the weaker.
    pub fn accepts_call(&self, called: OperationMode) -> bool {
        *self == called
            || (*self == OperationMode::Idempotent && called == OperationMode::Nonmutating)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── CompressionStatus ────────────────────────────────────────────

/// Whether the frame body past the header is compressed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionStatus {
    /// Body is uncompressed.
    None = 0x0,
    /// Peer supports compression; this body is not compressed.
    Supported = 0x1,
    /// Body is zstd-compressed.
    Compressed = 0x2,
}

impl TryFrom<u8> for CompressionStatus {
    type Error = OrbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(CompressionStatus::None),
            0x1 => Ok(CompressionStatus::Supported),
            0x2 => Ok(CompressionStatus::Compressed),
            _ => Err(OrbError::UnknownVariant {
                type_name: "CompressionStatus",
                value: value as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrip() {
        let kinds = [
            MessageType::Request,
            MessageType::BatchRequest,
            MessageType::Reply,
            MessageType::ValidateConnection,
            MessageType::CloseConnection,
        ];
        for k in kinds {
            assert_eq!(MessageType::try_from(k as u8).unwrap(), k);
        }
    }

    #[test]
    fn message_type_invalid() {
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn reply_status_roundtrip() {
        let statuses = [
            ReplyStatus::Ok,
            ReplyStatus::UserException,
            ReplyStatus::ObjectNotExist,
            ReplyStatus::FacetNotExist,
            ReplyStatus::OperationNotExist,
            ReplyStatus::UnknownLocalException,
            ReplyStatus::UnknownUserException,
            ReplyStatus::UnknownException,
        ];
        for s in statuses {
            assert_eq!(ReplyStatus::try_from(s as u8).unwrap(), s);
        }
        assert!(ReplyStatus::try_from(0x8).is_err());
    }

    #[test]
    fn reply_status_classification() {
        assert!(ReplyStatus::Ok.has_encapsulation());
        assert!(ReplyStatus::UserException.has_encapsulation());
        assert!(!ReplyStatus::ObjectNotExist.has_encapsulation());
        assert!(ReplyStatus::FacetNotExist.is_not_exist());
        assert!(!ReplyStatus::UnknownException.is_not_exist());
    }

    #[test]
    fn mode_matrix() {
        use OperationMode::*;
        // Exact matches.
        assert!(Normal.accepts_call(Normal));
        assert!(Nonmutating.accepts_call(Nonmutating));
        assert!(Idempotent.accepts_call(Idempotent));
        // The single tolerated mismatch.
        assert!(Idempotent.accepts_call(Nonmutating));
        // Everything else is rejected.
        assert!(!Normal.accepts_call(Nonmutating));
        assert!(!Normal.accepts_call(Idempotent));
        assert!(!Nonmutating.accepts_call(Normal));
        assert!(!Nonmutating.accepts_call(Idempotent));
        assert!(!Idempotent.accepts_call(Normal));
    }

    #[test]
    fn compression_status_invalid() {
        assert!(CompressionStatus::try_from(0x3).is_err());
        assert_eq!(
            CompressionStatus::try_from(0x2).unwrap(),
            CompressionStatus::Compressed
        );
    }
}
