//! Write side of the streaming codec.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MarshalError;
use crate::value::{SlicedData, UnknownSlicedValue, UserException, Value, ValueRef, value_ptr};

use super::{ENCODING_1_1, EncodingVersion, FormatType, SIZE_MARKER, SliceFlags};

/// Growable output buffer with encapsulation and class-slice support.
///
/// The buffer is owned exclusively by the stream; callers needing
/// concurrent streams create separate instances. After [`finished`]
/// the accumulated bytes are handed off without copying.
///
/// [`finished`]: OutputStream::finished
pub struct OutputStream {
    buf: BytesMut,
    encoding: EncodingVersion,
    format: FormatType,
    encaps: Vec<WriteEncaps>,
}

struct WriteEncaps {
    /// Offset of the 4-byte size slot to backpatch.
    start: usize,
    encoding: EncodingVersion,
    state: ValueWriteState,
}

/// Per-encapsulation class marshaling state: the instance identity
/// table (for back references and cycles) and the type-id table.
/// Built fresh per encapsulation, discarded at its end.
#[derive(Default)]
struct ValueWriteState {
    instances: HashMap<usize, u32>,
    type_ids: HashMap<String, u32>,
    slices: Vec<SliceBuild>,
}

struct SliceBuild {
    flags_pos: usize,
    flags: SliceFlags,
    size_pos: Option<usize>,
    indirection: Vec<ValueRef>,
    local_index: HashMap<usize, u32>,
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStream {
    pub fn new() -> Self {
        Self::with_encoding(ENCODING_1_1)
    }

    pub fn with_encoding(encoding: EncodingVersion) -> Self {
        OutputStream {
            buf: BytesMut::new(),
            encoding,
            format: FormatType::default(),
            encaps: Vec::new(),
        }
    }

    /// Select the class encoding format for subsequently written values.
    pub fn set_format(&mut self, format: FormatType) {
        self.format = format;
    }

    /// The encoding in effect at the current write position.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps.last().map(|e| e.encoding).unwrap_or(self.encoding)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the stream, yielding the bounded byte view for the
    /// transport to send without copying.
    pub fn finished(mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    // ── Primitives ───────────────────────────────────────────────

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Variable-length size: one byte up to 254, else marker + u32.
    pub fn write_size(&mut self, v: usize) {
        if v < SIZE_MARKER as usize {
            self.buf.put_u8(v as u8);
        } else {
            debug_assert!(v <= u32::MAX as usize, "size exceeds wire range");
            self.buf.put_u8(SIZE_MARKER);
            self.buf.put_u32_le(v as u32);
        }
    }

    pub fn write_string(&mut self, v: &str) {
        self.write_size(v.len());
        self.buf.put_slice(v.as_bytes());
    }

    pub fn write_string_seq(&mut self, v: &[String]) {
        self.write_size(v.len());
        for s in v {
            self.write_string(s);
        }
    }

    /// Length-prefixed byte sequence.
    pub fn write_byte_seq(&mut self, v: &[u8]) {
        self.write_size(v.len());
        self.buf.put_slice(v);
    }

    /// Raw bytes, no length prefix.
    pub fn write_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// String-to-string dictionary (request contexts).
    pub fn write_context(&mut self, ctx: &HashMap<String, String>) {
        self.write_size(ctx.len());
        // Sorted for a deterministic wire image.
        let mut keys: Vec<_> = ctx.keys().collect();
        keys.sort();
        for k in keys {
            self.write_string(k);
            self.write_string(&ctx[k]);
        }
    }

    // ── Patching ─────────────────────────────────────────────────

    /// Reserve a 4-byte slot and return its offset for later patching.
    pub fn reserve_u32(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.put_u32_le(0);
        pos
    }

    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    // ── Encapsulations ───────────────────────────────────────────

    /// Open an encapsulation with the stream's current encoding.
    pub fn start_encapsulation(&mut self) {
        let enc = self.encoding();
        self.start_encapsulation_with(enc);
    }

    /// Open an encapsulation with an explicit encoding version, fixed
    /// for the encapsulation's lifetime.
    pub fn start_encapsulation_with(&mut self, encoding: EncodingVersion) {
        let start = self.reserve_u32();
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.encaps.push(WriteEncaps {
            start,
            encoding,
            state: ValueWriteState::default(),
        });
    }

    /// Close the innermost encapsulation, backpatching its size.
    /// The size includes the 4-byte size field itself.
    pub fn end_encapsulation(&mut self) -> Result<(), MarshalError> {
        let encaps = self
            .encaps
            .pop()
            .ok_or(MarshalError::StreamMisuse("end_encapsulation without start"))?;
        if !encaps.state.slices.is_empty() {
            return Err(MarshalError::StreamMisuse("encapsulation ended inside a slice"));
        }
        let size = (self.buf.len() - encaps.start) as u32;
        self.patch_u32(encaps.start, size);
        Ok(())
    }

    /// A six-byte encapsulation with no payload.
    pub fn write_empty_encapsulation(&mut self) {
        self.buf.put_u32_le(6);
        self.buf.put_u8(self.encoding.major);
        self.buf.put_u8(self.encoding.minor);
    }

    /// Copy a pre-encoded encapsulation verbatim (pass-through
    /// forwarding without re-decode).
    pub fn write_encapsulation(&mut self, encaps: &[u8]) -> Result<(), MarshalError> {
        if encaps.len() < 6 {
            return Err(MarshalError::InvalidEncapsulation("shorter than minimum"));
        }
        self.buf.put_slice(encaps);
        Ok(())
    }

    // ── Class slicing ────────────────────────────────────────────

    fn value_state(&mut self) -> Result<&mut WriteEncaps, MarshalError> {
        self.encaps
            .last_mut()
            .ok_or(MarshalError::StreamMisuse("value written outside encapsulation"))
    }

    fn check_slicing(&self) -> Result<(), MarshalError> {
        let enc = self.encoding();
        if !enc.supports_slicing() {
            return Err(MarshalError::NotSupportedByEncoding {
                major: enc.major,
                minor: enc.minor,
                what: "class instances",
            });
        }
        Ok(())
    }

    /// Write a value reference: null, back reference, or inline
    /// instance.
    ///
    /// Inside a sliced-format slice the reference goes through the
    /// slice's indirection table instead, keeping the slice body
    /// self-describing for receivers that cannot decode it.
    pub fn write_value(&mut self, v: Option<&ValueRef>) -> Result<(), MarshalError> {
        self.check_slicing()?;
        let in_sliced_slice = {
            let encaps = self.value_state()?;
            encaps
                .state
                .slices
                .last()
                .map(|s| s.size_pos.is_some())
                .unwrap_or(false)
        };
        match v {
            None => {
                self.write_size(0);
                Ok(())
            }
            Some(v) if in_sliced_slice => {
                let encaps = self.value_state()?;
                let slice = encaps.state.slices.last_mut().expect("checked above");
                let ptr = value_ptr(v);
                let local = match slice.local_index.get(&ptr) {
                    Some(&idx) => idx,
                    None => {
                        slice.indirection.push(v.clone());
                        let idx = slice.indirection.len() as u32;
                        slice.local_index.insert(ptr, idx);
                        idx
                    }
                };
                self.write_size(local as usize);
                Ok(())
            }
            Some(v) => self.write_value_inline(v),
        }
    }

    /// Global reference scheme: 0 = null, 1 = inline instance follows,
    /// n >= 2 = back reference to instance n - 1.
    fn write_value_inline(&mut self, v: &ValueRef) -> Result<(), MarshalError> {
        let ptr = value_ptr(v);
        let existing = self.value_state()?.state.instances.get(&ptr).copied();
        if let Some(idx) = existing {
            self.write_size(idx as usize + 1);
            return Ok(());
        }
        self.write_size(1);
        {
            let encaps = self.value_state()?;
            let idx = encaps.state.instances.len() as u32 + 1;
            encaps.state.instances.insert(ptr, idx);
        }

        let preserved = v.borrow().sliced_data().cloned().filter(|d| !d.is_empty());
        let is_unknown = v.borrow().as_any().is::<UnknownSlicedValue>();
        if let Some(data) = preserved {
            // Preserved (unrecognized) slices are the most-derived
            // levels; they go out first, byte-faithfully. Only
            // possible in sliced format — compact cannot represent
            // them and they are omitted there.
            if self.format == FormatType::Sliced {
                self.write_preserved_slices(&data, is_unknown)?;
            }
            if is_unknown && self.format != FormatType::Sliced {
                return Err(MarshalError::InvalidSlice(
                    "unknown sliced value requires the sliced format",
                ));
            }
        }
        if !is_unknown {
            let guard = v.borrow();
            guard.write(self)?;
        }
        Ok(())
    }

    fn write_preserved_slices(
        &mut self,
        data: &SlicedData,
        final_is_last: bool,
    ) -> Result<(), MarshalError> {
        let count = data.slices.len();
        for (i, slice) in data.slices.iter().enumerate() {
            let last = final_is_last && i + 1 == count;
            let type_id = if slice.type_id.is_empty() { None } else { Some(slice.type_id.as_str()) };
            self.start_raw_slice(type_id, slice.compact_id, last)?;
            self.write_raw(&slice.bytes);
            {
                let encaps = self.value_state()?;
                let build = encaps
                    .state
                    .slices
                    .last_mut()
                    .ok_or(MarshalError::StreamMisuse("preserved slice state lost"))?;
                for inst in &slice.instances {
                    // Preserved indirection entries must all be
                    // resolved, or the raw body's local indices would
                    // shift on re-marshal.
                    let inst = inst
                        .as_ref()
                        .ok_or(MarshalError::InvalidSlice("unresolved preserved reference"))?;
                    build.indirection.push(inst.clone());
                }
            }
            self.end_slice()?;
        }
        Ok(())
    }

    /// Open one slice of a class instance, most-derived first.
    pub fn start_slice(
        &mut self,
        type_id: &str,
        compact_id: Option<i32>,
        last: bool,
    ) -> Result<(), MarshalError> {
        self.check_slicing()?;
        self.start_raw_slice(Some(type_id), compact_id, last)
    }

    fn start_raw_slice(
        &mut self,
        type_id: Option<&str>,
        compact_id: Option<i32>,
        last: bool,
    ) -> Result<(), MarshalError> {
        let sliced = self.format == FormatType::Sliced;

        let mut flags = SliceFlags::empty();
        if last {
            flags |= SliceFlags::IS_LAST;
        }
        if sliced {
            flags |= SliceFlags::HAS_SLICE_SIZE;
        }

        // Type id: compact when available, indexed after first use.
        enum IdEnc {
            Compact(i32),
            Index(u32),
            String(String),
        }
        let id_enc = if let Some(id) = compact_id {
            flags |= SliceFlags::TYPE_ID_COMPACT;
            IdEnc::Compact(id)
        } else {
            let tid = type_id.unwrap_or("");
            let known = {
                let encaps = self.value_state()?;
                encaps.state.type_ids.get(tid).copied()
            };
            match known {
                Some(idx) => {
                    flags |= SliceFlags::TYPE_ID_INDEX;
                    IdEnc::Index(idx)
                }
                None => {
                    let encaps = self.value_state()?;
                    let idx = encaps.state.type_ids.len() as u32 + 1;
                    encaps.state.type_ids.insert(tid.to_string(), idx);
                    flags |= SliceFlags::TYPE_ID_STRING;
                    IdEnc::String(tid.to_string())
                }
            }
        };

        let flags_pos = self.buf.len();
        self.buf.put_u8(flags.bits());
        match id_enc {
            IdEnc::Compact(id) => self.write_size(id as usize),
            IdEnc::Index(idx) => self.write_size(idx as usize),
            IdEnc::String(s) => self.write_string(&s),
        }
        let size_pos = if sliced { Some(self.reserve_u32()) } else { None };

        let encaps = self.value_state()?;
        encaps.state.slices.push(SliceBuild {
            flags_pos,
            flags,
            size_pos,
            indirection: Vec::new(),
            local_index: HashMap::new(),
        });
        Ok(())
    }

    /// Close the current slice: backpatch its size, then emit the
    /// indirection table (whose inline instances land after the slice
    /// body, outside the patched size).
    pub fn end_slice(&mut self) -> Result<(), MarshalError> {
        let build = {
            let encaps = self.value_state()?;
            encaps
                .state
                .slices
                .pop()
                .ok_or(MarshalError::StreamMisuse("end_slice without start_slice"))?
        };
        if let Some(size_pos) = build.size_pos {
            // Size covers the 4-byte size field plus the member bytes.
            let size = (self.buf.len() - size_pos) as u32;
            self.patch_u32(size_pos, size);
        }
        let mut flags = build.flags;
        if !build.indirection.is_empty() {
            flags |= SliceFlags::HAS_INDIRECTION;
            self.write_size(build.indirection.len());
            for inst in &build.indirection {
                self.write_value_inline(inst)?;
            }
        }
        self.buf[build.flags_pos] = flags.bits();
        Ok(())
    }

    /// Emit all slices of preserved data, flagging the final one last.
    /// Used by pass-through placeholders that carry nothing else.
    pub fn write_sliced_data(&mut self, data: &SlicedData) -> Result<(), MarshalError> {
        self.write_preserved_slices(data, true)
    }

    // ── Exceptions ───────────────────────────────────────────────

    /// Marshal a user exception slice-by-slice.
    pub fn write_exception(&mut self, ex: &dyn UserException) -> Result<(), MarshalError> {
        self.check_slicing()?;
        self.value_state()?;
        ex.write(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_encoding_boundary() {
        let mut os = OutputStream::new();
        os.write_size(254);
        assert_eq!(os.as_slice(), &[254]);

        let mut os = OutputStream::new();
        os.write_size(255);
        assert_eq!(os.as_slice(), &[0xFF, 255, 0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "size exceeds wire range")]
    #[cfg(all(debug_assertions, target_pointer_width = "64"))]
    fn oversized_size_panics_in_debug() {
        let mut os = OutputStream::new();
        os.write_size(u32::MAX as usize + 1);
    }

    #[test]
    fn encapsulation_backpatch() {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_i32(7);
        os.end_encapsulation().unwrap();

        let bytes = os.finished();
        // size (4) + version (2) + payload (4)
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 10);
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 1);
    }

    #[test]
    fn nested_encapsulations() {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.start_encapsulation();
        os.write_u8(1);
        os.end_encapsulation().unwrap();
        os.end_encapsulation().unwrap();

        let bytes = os.finished();
        let outer = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let inner = u32::from_le_bytes(bytes[6..10].try_into().unwrap());
        assert_eq!(outer as usize, bytes.len());
        assert_eq!(inner, 7);
    }

    #[test]
    fn end_without_start_is_misuse() {
        let mut os = OutputStream::new();
        assert!(matches!(
            os.end_encapsulation(),
            Err(MarshalError::StreamMisuse(_))
        ));
    }

    #[test]
    fn class_marshaling_gated_on_legacy_encoding() {
        let mut os = OutputStream::with_encoding(super::super::ENCODING_1_0);
        os.start_encapsulation();
        let err = os.write_value(None).unwrap_err();
        assert!(matches!(err, MarshalError::NotSupportedByEncoding { .. }));
    }

    #[test]
    fn context_is_sorted() {
        let mut ctx = HashMap::new();
        ctx.insert("b".to_string(), "2".to_string());
        ctx.insert("a".to_string(), "1".to_string());

        let mut os = OutputStream::new();
        os.write_context(&ctx);
        let bytes = os.finished();
        // count, then "a" before "b"
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[2..3], b"a");
    }
}
