//! Fixed 14-byte header preceding every protocol message.

use crate::error::OrbError;
use crate::message::{CompressionStatus, MessageType};
use crate::stream::EncodingVersion;

/// Protocol magic, first four bytes on the wire.
pub const MAGIC: [u8; 4] = *b"ORB1";

/// The protocol version this implementation speaks.
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

pub const HEADER_LENGTH: usize = 14;

pub type HeaderBytes = [u8; HEADER_LENGTH];

/// Wire layout, all multi-byte fields little-endian:
///
/// ```text
/// offset 0  magic            "ORB1"
/// offset 4  protocol         major, minor
/// offset 6  encoding         major, minor
/// offset 8  message type     u8
/// offset 9  compression      u8
/// offset 10 total size       u32 (header included)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub encoding: EncodingVersion,
    pub message_type: MessageType,
    pub compression: CompressionStatus,
    /// Total message size in bytes, header included.
    pub size: u32,
}

impl Header {
    pub fn new(message_type: MessageType, compression: CompressionStatus, size: u32) -> Self {
        Header {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            encoding: crate::stream::ENCODING_1_1,
            message_type,
            compression,
            size,
        }
    }

    pub fn to_bytes(&self) -> HeaderBytes {
        let mut out: HeaderBytes = [0; HEADER_LENGTH];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = self.protocol_major;
        out[5] = self.protocol_minor;
        out[6] = self.encoding.major;
        out[7] = self.encoding.minor;
        out[8] = self.message_type as u8;
        out[9] = self.compression as u8;
        out[10..14].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: HeaderBytes) -> Result<Self, OrbError> {
        if bytes[0..4] != MAGIC {
            return Err(OrbError::InvalidMagic);
        }
        let protocol_major = bytes[4];
        let protocol_minor = bytes[5];
        // Only a major bump is incompatible; an unknown minor from a
        // newer peer still speaks our messages.
        if protocol_major != PROTOCOL_MAJOR {
            return Err(OrbError::UnsupportedProtocol {
                major: protocol_major,
                minor: protocol_minor,
            });
        }
        let encoding = EncodingVersion {
            major: bytes[6],
            minor: bytes[7],
        };
        if encoding.major != 1 {
            return Err(OrbError::UnsupportedEncoding {
                major: encoding.major,
                minor: encoding.minor,
            });
        }
        let message_type = MessageType::try_from(bytes[8])?;
        let compression = CompressionStatus::try_from(bytes[9])?;
        let size = u32::from_le_bytes(bytes[10..14].try_into().expect("length checked"));
        if (size as usize) < HEADER_LENGTH {
            return Err(OrbError::InvalidHeader("size below header length"));
        }
        Ok(Header {
            protocol_major,
            protocol_minor,
            encoding,
            message_type,
            compression,
            size,
        })
    }

    /// Body length in bytes, past the header.
    pub fn body_length(&self) -> usize {
        self.size as usize - HEADER_LENGTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let h = Header::new(MessageType::Request, CompressionStatus::None, 128);
        let parsed = Header::from_bytes(h.to_bytes()).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.body_length(), 128 - HEADER_LENGTH);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = Header::new(MessageType::Reply, CompressionStatus::None, 14).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(Header::from_bytes(bytes), Err(OrbError::InvalidMagic)));
    }

    #[test]
    fn protocol_major_mismatch_rejected_minor_tolerated() {
        let mut bytes = Header::new(MessageType::Reply, CompressionStatus::None, 14).to_bytes();
        bytes[4] = 2;
        assert!(matches!(
            Header::from_bytes(bytes),
            Err(OrbError::UnsupportedProtocol { major: 2, .. })
        ));

        let mut bytes = Header::new(MessageType::Reply, CompressionStatus::None, 14).to_bytes();
        bytes[5] = 9;
        assert!(Header::from_bytes(bytes).is_ok());
    }

    #[test]
    fn undersized_frame_rejected() {
        let mut bytes = Header::new(MessageType::Reply, CompressionStatus::None, 14).to_bytes();
        bytes[10..14].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            Header::from_bytes(bytes),
            Err(OrbError::InvalidHeader(_))
        ));
    }

    #[test]
    fn unknown_message_type_rejected() {
        let mut bytes = Header::new(MessageType::Reply, CompressionStatus::None, 14).to_bytes();
        bytes[8] = 0x9;
        assert!(matches!(
            Header::from_bytes(bytes),
            Err(OrbError::UnknownVariant { type_name: "MessageType", .. })
        ));
    }
}
