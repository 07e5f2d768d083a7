//! Streaming codec for the ORB encoding.
//!
//! [`OutputStream`] serializes into a growable buffer; [`InputStream`]
//! deserializes from a borrowed byte slice. Both understand
//! encapsulations (size-prefixed, version-tagged byte regions) and the
//! slice-based class/exception encoding layered on top.
//!
//! All numerics are fixed-width little-endian. Sizes use a variable
//! encoding: values up to 254 take one byte; larger values are a
//! `0xFF` marker followed by a 4-byte length.

mod input;
mod output;

pub use input::InputStream;
pub use output::OutputStream;

use bitflags::bitflags;

use crate::error::MarshalError;

/// Marker byte indicating a 4-byte size follows.
pub(crate) const SIZE_MARKER: u8 = 0xFF;

/// An encoding version, fixed for the lifetime of an encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

/// Legacy encoding. No class instances, no slice preservation.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// Current encoding: slice flags, indirection tables, preservation.
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

impl EncodingVersion {
    /// Whether this version supports the sliced class encoding.
    pub fn supports_slicing(&self) -> bool {
        *self >= ENCODING_1_1
    }

    pub(crate) fn check_supported(&self) -> Result<(), MarshalError> {
        match (self.major, self.minor) {
            (1, 0) | (1, 1) => Ok(()),
            _ => Err(MarshalError::InvalidEncapsulation("unsupported encoding version")),
        }
    }
}

impl PartialOrd for EncodingVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl std::fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Class encoding format selected by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatType {
    /// Minimal slices: no per-slice sizes or indirection tables.
    /// Receivers must know every type; nothing can be preserved.
    Compact,
    /// Self-describing slices with sizes and indirection tables, so
    /// unknown slices can be skipped or preserved.
    #[default]
    Sliced,
}

bitflags! {
    /// Leading flags byte of every class/exception slice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SliceFlags: u8 {
        /// Type id encoded as a full string (first occurrence).
        const TYPE_ID_STRING = 0b0000_0001;
        /// Type id encoded as an index into previously sent ids.
        const TYPE_ID_INDEX = 0b0000_0010;
        /// Type id encoded as a compact numeric id.
        const TYPE_ID_COMPACT = 0b0000_0011;
        /// An indirection table follows the slice body.
        const HAS_INDIRECTION = 0b0000_0100;
        /// The slice body is preceded by its byte size.
        const HAS_SLICE_SIZE = 0b0000_1000;
        /// This is the last slice of the instance.
        const IS_LAST = 0b0010_0000;
    }
}

impl SliceFlags {
    pub(crate) const TYPE_ID_MASK: u8 = 0b0000_0011;
}
