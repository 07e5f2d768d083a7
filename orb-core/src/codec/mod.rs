//! Tokio codec pairing the fixed header with a message body.
//!
//! Handles frame length limits and optional zstd body compression so
//! the connection layer only ever sees whole [`Message`]s.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::OrbError;
use crate::frame::Message;
use crate::header::{Header, HEADER_LENGTH, HeaderBytes};
use crate::message::CompressionStatus;
use crate::stream::OutputStream;

/// Hard upper bound on a single frame, compressed or not.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Bodies below this stay uncompressed; the zstd overhead is not
/// worth it for small messages.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const COMPRESSION_LEVEL: i32 = 3;

pub struct MessageCodec {
    max_frame_size: usize,
    compress: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec {
            max_frame_size: MAX_FRAME_SIZE,
            compress: false,
        }
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable zstd compression for outgoing bodies above the
    /// threshold. Decoding always accepts compressed frames.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = OrbError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut os = OutputStream::new();
        item.write_body(&mut os)?;
        let body = os.finished();

        let (compression, stored): (CompressionStatus, Vec<u8>) =
            if self.compress && body.len() >= COMPRESSION_THRESHOLD {
                // Compressed layout: uncompressed length, then the
                // zstd stream.
                let mut out = Vec::with_capacity(body.len() / 2 + 4);
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                let compressed = zstd::encode_all(body.as_ref(), COMPRESSION_LEVEL)
                    .map_err(|e| OrbError::Compression(format!("zstd encode failed: {e}")))?;
                out.extend_from_slice(&compressed);
                (CompressionStatus::Compressed, out)
            } else {
                (CompressionStatus::None, body.to_vec())
            };

        let total = HEADER_LENGTH + stored.len();
        if total > self.max_frame_size {
            return Err(OrbError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }

        let header = Header::new(item.message_type(), compression, total as u32);
        dst.reserve(total);
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&stored);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = OrbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let header_bytes: HeaderBytes = src[..HEADER_LENGTH].try_into().expect("length checked");
        let header = Header::from_bytes(header_bytes)?;
        let total = header.size as usize;
        if total > self.max_frame_size {
            return Err(OrbError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(HEADER_LENGTH);

        let body = match header.compression {
            CompressionStatus::Compressed => {
                if frame.len() < 4 {
                    return Err(OrbError::Compression("missing uncompressed length".to_string()));
                }
                let uncompressed = u32::from_le_bytes(frame[..4].try_into().expect("length checked"));
                if uncompressed as usize > self.max_frame_size {
                    return Err(OrbError::FrameTooLarge {
                        size: uncompressed as usize,
                        max: self.max_frame_size,
                    });
                }
                frame.advance(4);
                let body = zstd::decode_all(frame.as_ref())
                    .map_err(|e| OrbError::Compression(format!("zstd decode failed: {e}")))?;
                if body.len() != uncompressed as usize {
                    return Err(OrbError::Compression("uncompressed length mismatch".to_string()));
                }
                body
            }
            CompressionStatus::None | CompressionStatus::Supported => frame.to_vec(),
        };

        Message::read_body(header.message_type, &body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ReplyFrame;
    use crate::identity::Identity;
    use crate::message::{OperationMode, ReplyStatus};
    use std::collections::HashMap;

    fn request_with_params(params_payload: &[u8]) -> Message {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_byte_seq(params_payload);
        os.end_encapsulation().unwrap();
        Message::Request(crate::frame::RequestFrame {
            request_id: 1,
            identity: Identity::new("echo", ""),
            facet: String::new(),
            operation: "say".to_string(),
            mode: OperationMode::Normal,
            context: HashMap::new(),
            params: os.finished(),
        })
    }

    fn codec_roundtrip(codec: &mut MessageCodec, msg: Message) -> Message {
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().expect("whole frame buffered")
    }

    #[test]
    fn roundtrip_uncompressed() {
        let mut codec = MessageCodec::new();
        let out = codec_roundtrip(&mut codec, request_with_params(b"hello"));
        let Message::Request(req) = out else { panic!("wrong variant") };
        assert_eq!(req.operation, "say");
    }

    #[test]
    fn roundtrip_compressed_large_body() {
        let mut codec = MessageCodec::new().with_compression(true);
        let payload = vec![0x42u8; 8192];

        let mut buf = BytesMut::new();
        codec.encode(request_with_params(&payload), &mut buf).unwrap();
        // Highly repetitive payload must actually shrink.
        assert!(buf.len() < payload.len());
        let header = Header::from_bytes(buf[..HEADER_LENGTH].try_into().unwrap()).unwrap();
        assert_eq!(header.compression as u8, CompressionStatus::Compressed as u8);

        let Message::Request(req) = codec.decode(&mut buf).unwrap().unwrap() else {
            panic!("wrong variant")
        };
        let mut is = crate::stream::InputStream::new(&req.params);
        is.start_encapsulation().unwrap();
        assert_eq!(is.read_byte_seq().unwrap(), payload);
    }

    #[test]
    fn small_bodies_skip_compression() {
        let mut codec = MessageCodec::new().with_compression(true);
        let mut buf = BytesMut::new();
        codec.encode(request_with_params(b"tiny"), &mut buf).unwrap();
        let header = Header::from_bytes(buf[..HEADER_LENGTH].try_into().unwrap()).unwrap();
        assert_eq!(header.compression as u8, CompressionStatus::None as u8);
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(request_with_params(b"hello"), &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..HEADER_LENGTH + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header alone is not enough either.
        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = MessageCodec::new().with_max_frame_size(64);
        let mut buf = BytesMut::new();
        let err = codec.encode(request_with_params(&[0u8; 256]), &mut buf).unwrap_err();
        assert!(matches!(err, OrbError::FrameTooLarge { .. }));
    }

    #[test]
    fn garbage_magic_is_an_error_not_a_stall() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(OrbError::InvalidMagic)));
    }

    #[test]
    fn control_messages_roundtrip() {
        let mut codec = MessageCodec::new();
        assert!(matches!(
            codec_roundtrip(&mut codec, Message::ValidateConnection),
            Message::ValidateConnection
        ));
        assert!(matches!(
            codec_roundtrip(&mut codec, Message::CloseConnection),
            Message::CloseConnection
        ));
    }

    #[test]
    fn reply_roundtrip_through_codec() {
        let mut codec = MessageCodec::new();
        let mut os = OutputStream::new();
        os.write_empty_encapsulation();
        let reply = Message::Reply(ReplyFrame::ok(9, os.finished()));
        let Message::Reply(out) = codec_roundtrip(&mut codec, reply) else {
            panic!("wrong variant")
        };
        assert_eq!(out.request_id, 9);
        assert_eq!(out.status, ReplyStatus::Ok);
    }
}
