//! Read side of the streaming codec.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::MarshalError;
use crate::value::{FactoryRegistry, SliceInfo, SlicedData, UnknownSlicedValue, UserException, ValueRef};

use super::{EncodingVersion, ENCODING_1_1, SIZE_MARKER, SliceFlags};

/// Deferred assignment of a decoded value reference into its member
/// slot. Patches run only when no instance is mid-decode, which is
/// what makes cyclic graphs safe to resolve.
pub type Patch = Box<dyn FnOnce(Option<ValueRef>) -> Result<(), MarshalError>>;

enum PatchTarget {
    Resolved(Option<ValueRef>),
    /// Waiting on the instance with this 1-based table index.
    Index(u32),
}

struct SliceHeader {
    flags: SliceFlags,
    type_id: String,
    compact_id: Option<i32>,
    /// Body size including the 4-byte size field (sliced format only).
    size: Option<u32>,
    /// Offset of the first member byte.
    body_start: usize,
}

struct ReadSliceFrame {
    header: SliceHeader,
    /// (local indirection index, patch) recorded during member reads.
    local_patches: Vec<(u32, Patch)>,
}

struct TableEntry {
    value: Option<ValueRef>,
    /// Set when the entry back-references an instance still mid-decode.
    pending: Option<u32>,
}

/// Per-encapsulation decode state, discarded at encapsulation end.
#[derive(Default)]
struct ValueReadState {
    instances: Vec<Option<ValueRef>>,
    type_ids: Vec<String>,
    patches: Vec<(PatchTarget, Patch)>,
    depth: u32,
    cached_header: Option<SliceHeader>,
    slices: Vec<ReadSliceFrame>,
}

struct ReadEncaps {
    end: usize,
    encoding: EncodingVersion,
    state: ValueReadState,
}

/// Cursor over a borrowed byte slice with encapsulation awareness.
///
/// Decoding failures poison only this stream; the caller owns the
/// decision to drop the connection when framing can no longer be
/// trusted.
pub struct InputStream<'a> {
    buf: &'a [u8],
    pos: usize,
    encoding: EncodingVersion,
    factories: Option<&'a FactoryRegistry>,
    slicing_enabled: bool,
    encaps: Vec<ReadEncaps>,
}

impl<'a> InputStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_encoding(buf, ENCODING_1_1)
    }

    pub fn with_encoding(buf: &'a [u8], encoding: EncodingVersion) -> Self {
        InputStream {
            buf,
            pos: 0,
            encoding,
            factories: None,
            slicing_enabled: true,
            encaps: Vec::new(),
        }
    }

    /// Attach the factory registry used to instantiate decoded values
    /// and user exceptions.
    pub fn with_factories(mut self, factories: &'a FactoryRegistry) -> Self {
        self.factories = Some(factories);
        self
    }

    /// Disable slicing: unknown most-derived type ids become hard
    /// `NoValueFactory` errors instead of preserved placeholders.
    pub fn set_slicing_enabled(&mut self, enabled: bool) {
        self.slicing_enabled = enabled;
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The encoding in effect at the current read position.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps.last().map(|e| e.encoding).unwrap_or(self.encoding)
    }

    fn limit(&self) -> usize {
        self.encaps.last().map(|e| e.end).unwrap_or(self.buf.len())
    }

    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        if n > self.remaining() {
            return Err(MarshalError::EndOfBuffer {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    // ── Primitives ───────────────────────────────────────────────

    pub fn read_u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, MarshalError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, MarshalError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().expect("length checked")))
    }

    pub fn read_i32(&mut self) -> Result<i32, MarshalError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("length checked")))
    }

    pub fn read_u32(&mut self) -> Result<u32, MarshalError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("length checked")))
    }

    pub fn read_i64(&mut self) -> Result<i64, MarshalError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("length checked")))
    }

    pub fn read_f32(&mut self) -> Result<f32, MarshalError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().expect("length checked")))
    }

    pub fn read_f64(&mut self) -> Result<f64, MarshalError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().expect("length checked")))
    }

    pub fn read_size(&mut self) -> Result<usize, MarshalError> {
        let b = self.read_u8()?;
        if b < SIZE_MARKER {
            Ok(b as usize)
        } else {
            let v = self.read_u32()?;
            if v < SIZE_MARKER as u32 {
                return Err(MarshalError::InvalidSize);
            }
            Ok(v as usize)
        }
    }

    /// Read a sequence length and reject any declared length whose
    /// minimum byte footprint exceeds the remaining buffer. This is
    /// the guard against maliciously large length fields: nothing is
    /// allocated proportional to the bogus length.
    pub fn read_and_check_seq_size(&mut self, min_elem_size: usize) -> Result<usize, MarshalError> {
        let declared = self.read_size()?;
        let min = min_elem_size.max(1);
        if declared > self.remaining() / min {
            return Err(MarshalError::SequenceTooLong { declared });
        }
        Ok(declared)
    }

    pub fn read_string(&mut self) -> Result<String, MarshalError> {
        let len = self.read_and_check_seq_size(1)?;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_string())
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>, MarshalError> {
        let count = self.read_and_check_seq_size(1)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    pub fn read_byte_seq(&mut self) -> Result<Vec<u8>, MarshalError> {
        let len = self.read_and_check_seq_size(1)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_context(&mut self) -> Result<HashMap<String, String>, MarshalError> {
        let count = self.read_and_check_seq_size(2)?;
        let mut ctx = HashMap::with_capacity(count);
        for _ in 0..count {
            let k = self.read_string()?;
            let v = self.read_string()?;
            ctx.insert(k, v);
        }
        Ok(ctx)
    }

    // ── Encapsulations ───────────────────────────────────────────

    /// Open an encapsulation: validate its size and encoding version,
    /// and bound subsequent reads to its extent.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion, MarshalError> {
        let start = self.pos;
        let size = self.read_u32()? as usize;
        if size < 6 {
            return Err(MarshalError::InvalidEncapsulation("size below minimum"));
        }
        if start + size > self.limit() {
            return Err(MarshalError::InvalidEncapsulation("size exceeds buffer"));
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        let encoding = EncodingVersion { major, minor };
        encoding.check_supported()?;
        self.encaps.push(ReadEncaps {
            end: start + size,
            encoding,
            state: ValueReadState::default(),
        });
        Ok(encoding)
    }

    /// Close the innermost encapsulation: resolve pending value
    /// patches and validate that the payload was fully consumed.
    pub fn end_encapsulation(&mut self) -> Result<(), MarshalError> {
        self.flush_patches()?;
        let encaps = self
            .encaps
            .pop()
            .ok_or(MarshalError::StreamMisuse("end_encapsulation without start"))?;
        if !encaps.state.slices.is_empty() {
            return Err(MarshalError::StreamMisuse("encapsulation ended inside a slice"));
        }
        if self.pos < encaps.end {
            return Err(MarshalError::UnconsumedBytes(encaps.end - self.pos));
        }
        Ok(())
    }

    /// Advance past an encapsulation without decoding its contents.
    /// Required for forward compatibility with encodings this reader
    /// does not understand.
    pub fn skip_encapsulation(&mut self) -> Result<(), MarshalError> {
        let start = self.pos;
        let size = self.read_u32()? as usize;
        if size < 6 {
            return Err(MarshalError::InvalidEncapsulation("size below minimum"));
        }
        if start + size > self.limit() {
            return Err(MarshalError::InvalidEncapsulation("size exceeds buffer"));
        }
        self.pos = start + size;
        Ok(())
    }

    /// Borrow the raw bytes of the encapsulation at the cursor,
    /// advancing past it. Used to hand request parameters to servants
    /// without copying.
    pub fn read_encapsulation_slice(&mut self) -> Result<&'a [u8], MarshalError> {
        let start = self.pos;
        self.skip_encapsulation()?;
        Ok(&self.buf[start..self.pos])
    }

    // ── Class decoding ───────────────────────────────────────────

    fn state(&mut self) -> Result<&mut ValueReadState, MarshalError> {
        self.encaps
            .last_mut()
            .map(|e| &mut e.state)
            .ok_or(MarshalError::StreamMisuse("value read outside encapsulation"))
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

    /// Read a value reference; `patch` receives the decoded instance
    /// once it is safe to deliver (possibly not before
    /// [`read_pending_values`] / `end_encapsulation`).
    ///
    /// [`read_pending_values`]: InputStream::read_pending_values
    pub fn read_value(&mut self, patch: Patch) -> Result<(), MarshalError> {
        self.check_slicing()?;
        let in_sliced_slice = {
            let state = self.state()?;
            state
                .slices
                .last()
                .map(|f| f.header.size.is_some())
                .unwrap_or(false)
        };
        if in_sliced_slice {
            // Local indirection index, resolved at end_slice.
            let local = self.read_size()? as u32;
            let state = self.state()?;
            let frame = state.slices.last_mut().expect("checked above");
            if local == 0 {
                state.patches.push((PatchTarget::Resolved(None), patch));
            } else {
                frame.local_patches.push((local, patch));
            }
            Ok(())
        } else {
            self.read_value_inline(patch)
        }
    }

    fn read_value_inline(&mut self, patch: Patch) -> Result<(), MarshalError> {
        let n = self.read_size()?;
        let target = match n {
            0 => PatchTarget::Resolved(None),
            1 => {
                let v = self.read_instance()?;
                PatchTarget::Resolved(Some(v))
            }
            n => {
                let idx = (n - 1) as u32;
                let state = self.state()?;
                let slot = idx as usize - 1;
                match state.instances.get(slot) {
                    Some(Some(v)) => PatchTarget::Resolved(Some(v.clone())),
                    // Reserved but mid-decode: a cycle back into an
                    // ancestor still being read.
                    Some(None) => PatchTarget::Index(idx),
                    None => return Err(MarshalError::InvalidValueReference(idx as usize)),
                }
            }
        };
        let state = self.state()?;
        state.patches.push((target, patch));
        let flush = state.depth == 0;
        if flush {
            self.flush_patches()?;
        }
        Ok(())
    }

    /// Parse one inline instance: reserve its table slot, slice
    /// through unknown most-derived levels, then hand the remaining
    /// slices to the first recognized type (or fall back to an
    /// [`UnknownSlicedValue`] carrying everything).
    fn read_instance(&mut self) -> Result<ValueRef, MarshalError> {
        let slot = {
            let state = self.state()?;
            state.depth += 1;
            state.instances.push(None);
            state.instances.len() - 1
        };

        let mut preserved: Vec<SliceInfo> = Vec::new();
        let mut pending_fixups: Vec<(usize, usize, u32)> = Vec::new();
        let mut most_derived: Option<String> = None;

        let result = loop {
            let header = self.read_slice_header()?;
            if most_derived.is_none() {
                most_derived = Some(display_id(&header));
            }

            let instance = self.factories.and_then(|f| match header.compact_id {
                Some(id) => f.create_compact(id),
                None => f.create_value(&header.type_id),
            });

            if let Some(v) = instance {
                // Fill the slot before member reads so back
                // references into this instance resolve.
                self.state()?.instances[slot] = Some(v.clone());
                self.state()?.cached_header = Some(header);
                v.borrow_mut().read(self, &v)?;
                if self.state()?.cached_header.is_some() {
                    return Err(MarshalError::StreamMisuse("value read consumed no slice"));
                }
                if !preserved.is_empty() {
                    v.borrow_mut().set_sliced_data(SlicedData { slices: preserved });
                }
                break v;
            }

            // Unknown type at this level.
            let id = display_id(&header);
            if !self.slicing_enabled {
                return Err(MarshalError::NoValueFactory(id));
            }
            let Some(size) = header.size else {
                // Compact format carries no slice sizes, so an
                // unknown slice cannot be skipped or preserved.
                return Err(MarshalError::NoValueFactory(id));
            };

            let body = self.take(size as usize - 4)?.to_vec();
            let mut instances = Vec::new();
            if header.flags.contains(SliceFlags::HAS_INDIRECTION) {
                let entries = self.read_indirection_table()?;
                for (ei, entry) in entries.into_iter().enumerate() {
                    if let Some(g) = entry.pending {
                        pending_fixups.push((preserved.len(), ei, g));
                    }
                    instances.push(entry.value);
                }
            }
            let is_last = header.flags.contains(SliceFlags::IS_LAST);
            preserved.push(SliceInfo {
                type_id: header.type_id,
                compact_id: header.compact_id,
                bytes: body,
                instances,
                is_last,
            });

            if is_last {
                let v: ValueRef = Rc::new(RefCell::new(UnknownSlicedValue::new(
                    most_derived.clone().unwrap_or_default(),
                )));
                v.borrow_mut().set_sliced_data(SlicedData { slices: preserved });
                self.state()?.instances[slot] = Some(v.clone());
                break v;
            }
        };

        // Cyclic references inside preserved indirection tables are
        // filled in once the referenced ancestors finish decoding.
        for (si, ei, g) in pending_fixups {
            let target = result.clone();
            let patch: Patch = Box::new(move |v| {
                let mut guard = target.borrow_mut();
                let data = guard
                    .sliced_data_mut()
                    .ok_or(MarshalError::InvalidSlice("preserved data vanished"))?;
                data.slices[si].instances[ei] = v;
                Ok(())
            });
            self.state()?.patches.push((PatchTarget::Index(g), patch));
        }

        let state = self.state()?;
        state.depth -= 1;
        let flush = state.depth == 0;
        if flush {
            self.flush_patches()?;
        }
        Ok(result)
    }

    fn read_indirection_table(&mut self) -> Result<Vec<TableEntry>, MarshalError> {
        let count = self.read_and_check_seq_size(1)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let n = self.read_size()?;
            let entry = match n {
                0 => return Err(MarshalError::InvalidSlice("null indirection entry")),
                1 => TableEntry {
                    value: Some(self.read_instance()?),
                    pending: None,
                },
                n => {
                    let idx = (n - 1) as u32;
                    let state = self.state()?;
                    match state.instances.get(idx as usize - 1) {
                        Some(Some(v)) => TableEntry {
                            value: Some(v.clone()),
                            pending: None,
                        },
                        Some(None) => TableEntry {
                            value: None,
                            pending: Some(idx),
                        },
                        None => return Err(MarshalError::InvalidValueReference(idx as usize)),
                    }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn read_slice_header(&mut self) -> Result<SliceHeader, MarshalError> {
        let flags = SliceFlags::from_bits_retain(self.read_u8()?);
        let (type_id, compact_id) = match flags.bits() & SliceFlags::TYPE_ID_MASK {
            0b01 => {
                let id = self.read_string()?;
                self.state()?.type_ids.push(id.clone());
                (id, None)
            }
            0b10 => {
                let idx = self.read_size()?;
                let state = self.state()?;
                let id = state
                    .type_ids
                    .get(idx.wrapping_sub(1))
                    .ok_or(MarshalError::InvalidSlice("bad type id index"))?
                    .clone();
                (id, None)
            }
            0b11 => {
                let id = self.read_size()? as i32;
                (String::new(), Some(id))
            }
            _ => return Err(MarshalError::InvalidSlice("missing type id")),
        };
        let size = if flags.contains(SliceFlags::HAS_SLICE_SIZE) {
            let size = self.read_u32()?;
            if size < 4 || size as usize - 4 > self.remaining() {
                return Err(MarshalError::InvalidSlice("bad slice size"));
            }
            Some(size)
        } else {
            None
        };
        Ok(SliceHeader {
            flags,
            type_id,
            compact_id,
            size,
            body_start: self.pos,
        })
    }

    /// Open the next slice of the instance or exception being read,
    /// returning its type id.
    pub fn start_slice(&mut self) -> Result<String, MarshalError> {
        let header = match self.state()?.cached_header.take() {
            Some(h) => h,
            None => self.read_slice_header()?,
        };
        let tid = header.type_id.clone();
        self.state()?.slices.push(ReadSliceFrame {
            header,
            local_patches: Vec::new(),
        });
        Ok(tid)
    }

    /// Close the current slice: skip unread trailing members (fields
    /// added by a more derived sender), then resolve the slice's
    /// indirection table.
    pub fn end_slice(&mut self) -> Result<(), MarshalError> {
        let frame = {
            let state = self.state()?;
            state
                .slices
                .pop()
                .ok_or(MarshalError::StreamMisuse("end_slice without start_slice"))?
        };
        if let Some(size) = frame.header.size {
            let end = frame.header.body_start + size as usize - 4;
            if self.pos > end {
                return Err(MarshalError::InvalidSlice("slice body overrun"));
            }
            self.pos = end;
        }
        if frame.header.flags.contains(SliceFlags::HAS_INDIRECTION) {
            let entries = self.read_indirection_table()?;
            for (local, patch) in frame.local_patches {
                let entry = entries
                    .get(local as usize - 1)
                    .ok_or(MarshalError::InvalidSlice("indirection index out of range"))?;
                let target = match (&entry.value, entry.pending) {
                    (Some(v), _) => PatchTarget::Resolved(Some(v.clone())),
                    (None, Some(g)) => PatchTarget::Index(g),
                    (None, None) => {
                        return Err(MarshalError::InvalidSlice("unresolved indirection entry"));
                    }
                };
                self.state()?.patches.push((target, patch));
            }
        } else if !frame.local_patches.is_empty() {
            return Err(MarshalError::InvalidSlice(
                "member references without indirection table",
            ));
        }
        Ok(())
    }

    /// Resolve every pending member patch. Implicit at
    /// `end_encapsulation`; callable earlier once all top-level values
    /// of the encapsulation have been read.
    pub fn read_pending_values(&mut self) -> Result<(), MarshalError> {
        self.flush_patches()
    }

    fn flush_patches(&mut self) -> Result<(), MarshalError> {
        loop {
            let (target, patch) = {
                let state = match self.encaps.last_mut() {
                    Some(e) => &mut e.state,
                    None => return Ok(()),
                };
                if state.depth > 0 {
                    // Mid-decode: delivering now could alias a value
                    // whose RefCell is still mutably borrowed.
                    return Ok(());
                }
                match state.patches.pop() {
                    Some(p) => p,
                    None => return Ok(()),
                }
            };
            let value = match target {
                PatchTarget::Resolved(v) => v,
                PatchTarget::Index(idx) => {
                    let state = self.state()?;
                    match state.instances.get(idx as usize - 1) {
                        Some(Some(v)) => Some(v.clone()),
                        _ => return Err(MarshalError::InvalidValueReference(idx as usize)),
                    }
                }
            };
            patch(value)?;
        }
    }

    // ── Exceptions ───────────────────────────────────────────────

    /// Decode a user exception, slicing through unknown most-derived
    /// levels. If no level is recognized the most-derived type id is
    /// reported in the error.
    pub fn read_exception(&mut self) -> Result<Box<dyn UserException>, MarshalError> {
        self.check_slicing()?;
        self.state()?;
        let mut most_derived: Option<String> = None;
        loop {
            let header = self.read_slice_header()?;
            if most_derived.is_none() {
                most_derived = Some(display_id(&header));
            }

            if let Some(mut ex) = self
                .factories
                .and_then(|f| f.create_exception(&header.type_id))
            {
                self.state()?.cached_header = Some(header);
                ex.read(self)?;
                if self.state()?.cached_header.is_some() {
                    return Err(MarshalError::StreamMisuse("exception read consumed no slice"));
                }
                return Ok(ex);
            }

            let id = display_id(&header);
            if !self.slicing_enabled {
                return Err(MarshalError::NoValueFactory(id));
            }
            let Some(size) = header.size else {
                return Err(MarshalError::NoValueFactory(id));
            };
            self.take(size as usize - 4)?;
            if header.flags.contains(SliceFlags::HAS_INDIRECTION) {
                self.read_indirection_table()?;
            }
            if header.flags.contains(SliceFlags::IS_LAST) {
                return Err(MarshalError::NoValueFactory(most_derived.unwrap_or_default()));
            }
        }
    }
}

fn display_id(header: &SliceHeader) -> String {
    match header.compact_id {
        Some(id) => format!("compact:{id}"),
        None => header.type_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::OutputStream;

    #[test]
    fn primitive_roundtrip() {
        let mut os = OutputStream::new();
        os.write_u8(0xAB);
        os.write_bool(true);
        os.write_i16(-2);
        os.write_i32(123_456);
        os.write_i64(-9_000_000_000);
        os.write_f32(1.5);
        os.write_f64(-2.25);
        os.write_string("héllo");
        let bytes = os.finished();

        let mut is = InputStream::new(&bytes);
        assert_eq!(is.read_u8().unwrap(), 0xAB);
        assert!(is.read_bool().unwrap());
        assert_eq!(is.read_i16().unwrap(), -2);
        assert_eq!(is.read_i32().unwrap(), 123_456);
        assert_eq!(is.read_i64().unwrap(), -9_000_000_000);
        assert_eq!(is.read_f32().unwrap(), 1.5);
        assert_eq!(is.read_f64().unwrap(), -2.25);
        assert_eq!(is.read_string().unwrap(), "héllo");
        assert_eq!(is.remaining(), 0);
    }

    #[test]
    fn size_roundtrip_across_marker() {
        for n in [0usize, 1, 253, 254, 255, 256, 1_000_000] {
            let mut os = OutputStream::new();
            os.write_size(n);
            let bytes = os.finished();
            let mut is = InputStream::new(&bytes);
            assert_eq!(is.read_size().unwrap(), n);
        }
    }

    #[test]
    fn truncated_read_is_typed() {
        let mut is = InputStream::new(&[1, 2]);
        let err = is.read_i32().unwrap_err();
        assert!(matches!(err, MarshalError::EndOfBuffer { needed: 4, remaining: 2 }));
    }

    #[test]
    fn seq_size_guard_rejects_bogus_lengths() {
        // Declared length of ~4 billion with 5 bytes remaining.
        let buf = [SIZE_MARKER, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3, 4, 5];
        for min_elem in [1usize, 2, 4, 8, 100] {
            let mut is = InputStream::new(&buf);
            let err = is.read_and_check_seq_size(min_elem).unwrap_err();
            assert!(matches!(err, MarshalError::SequenceTooLong { .. }));
        }
    }

    #[test]
    fn seq_size_guard_accepts_exact_fit() {
        let mut os = OutputStream::new();
        os.write_size(5);
        os.write_raw(&[0; 20]);
        let bytes = os.finished();
        let mut is = InputStream::new(&bytes);
        assert_eq!(is.read_and_check_seq_size(4).unwrap(), 5);
    }

    #[test]
    fn non_canonical_size_rejected() {
        // 4-byte form holding a value that fits one byte.
        let buf = [SIZE_MARKER, 10, 0, 0, 0];
        let mut is = InputStream::new(&buf);
        assert!(matches!(is.read_size(), Err(MarshalError::InvalidSize)));
    }

    #[test]
    fn encapsulation_roundtrip_and_skip() {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_i32(42);
        os.end_encapsulation().unwrap();
        os.write_u8(0x77);
        let bytes = os.finished();

        // Decode it.
        let mut is = InputStream::new(&bytes);
        let enc = is.start_encapsulation().unwrap();
        assert_eq!(enc, ENCODING_1_1);
        assert_eq!(is.read_i32().unwrap(), 42);
        is.end_encapsulation().unwrap();
        assert_eq!(is.read_u8().unwrap(), 0x77);

        // Skip it.
        let mut is = InputStream::new(&bytes);
        is.skip_encapsulation().unwrap();
        assert_eq!(is.read_u8().unwrap(), 0x77);
    }

    #[test]
    fn unconsumed_encapsulation_bytes_error() {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_i32(42);
        os.end_encapsulation().unwrap();
        let bytes = os.finished();

        let mut is = InputStream::new(&bytes);
        is.start_encapsulation().unwrap();
        let err = is.end_encapsulation().unwrap_err();
        assert!(matches!(err, MarshalError::UnconsumedBytes(4)));
    }

    #[test]
    fn skip_truncated_encapsulation_fails() {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_i64(1);
        os.end_encapsulation().unwrap();
        let bytes = os.finished();

        let mut is = InputStream::new(&bytes[..bytes.len() - 2]);
        assert!(is.skip_encapsulation().is_err());
    }

    #[test]
    fn context_roundtrip() {
        let mut ctx = HashMap::new();
        ctx.insert("locale".to_string(), "en".to_string());
        ctx.insert("trace".to_string(), "1".to_string());

        let mut os = OutputStream::new();
        os.write_context(&ctx);
        let bytes = os.finished();
        let mut is = InputStream::new(&bytes);
        assert_eq!(is.read_context().unwrap(), ctx);
    }

    #[test]
    fn value_read_gated_on_legacy_encoding() {
        let mut os = OutputStream::new();
        os.start_encapsulation_with(crate::stream::ENCODING_1_0);
        os.end_encapsulation().unwrap();
        let bytes = os.finished();

        let mut is = InputStream::new(&bytes);
        is.start_encapsulation().unwrap();
        let err = is.read_value(Box::new(|_| Ok(()))).unwrap_err();
        assert!(matches!(err, MarshalError::NotSupportedByEncoding { .. }));
    }

    // ── Exception slicing ────────────────────────────────────────

    #[derive(Default)]
    struct DataError {
        reason: String,
    }

    impl UserException for DataError {
        fn type_id(&self) -> &'static str {
            "::test::DataError"
        }

        fn write(&self, os: &mut OutputStream) -> Result<(), MarshalError> {
            os.start_slice("::test::DataError", None, true)?;
            os.write_string(&self.reason);
            os.end_slice()
        }

        fn read(&mut self, is: &mut InputStream<'_>) -> Result<(), MarshalError> {
            is.start_slice()?;
            self.reason = is.read_string()?;
            is.end_slice()
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Default)]
    struct RangeError {
        reason: String,
        limit: i32,
    }

    impl UserException for RangeError {
        fn type_id(&self) -> &'static str {
            "::test::RangeError"
        }

        fn write(&self, os: &mut OutputStream) -> Result<(), MarshalError> {
            os.start_slice("::test::RangeError", None, false)?;
            os.write_i32(self.limit);
            os.end_slice()?;
            os.start_slice("::test::DataError", None, true)?;
            os.write_string(&self.reason);
            os.end_slice()
        }

        fn read(&mut self, is: &mut InputStream<'_>) -> Result<(), MarshalError> {
            is.start_slice()?;
            self.limit = is.read_i32()?;
            is.end_slice()?;
            is.start_slice()?;
            self.reason = is.read_string()?;
            is.end_slice()
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// Decoder that never opens the slice handed to it.
    struct InertError;

    impl UserException for InertError {
        fn type_id(&self) -> &'static str {
            "::test::InertError"
        }

        fn write(&self, _os: &mut OutputStream) -> Result<(), MarshalError> {
            Ok(())
        }

        fn read(&mut self, _is: &mut InputStream<'_>) -> Result<(), MarshalError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn marshaled_range_error() -> bytes::Bytes {
        let mut os = OutputStream::new();
        os.start_encapsulation();
        os.write_exception(&RangeError {
            reason: "out of range".to_string(),
            limit: 9,
        })
        .unwrap();
        os.end_encapsulation().unwrap();
        os.finished()
    }

    #[test]
    fn known_exception_round_trip() {
        let mut factories = FactoryRegistry::default();
        factories.add_exception("::test::RangeError", || Box::new(RangeError::default()));

        let bytes = marshaled_range_error();
        let mut is = InputStream::new(&bytes).with_factories(&factories);
        is.start_encapsulation().unwrap();
        let ex = is.read_exception().unwrap();
        is.end_encapsulation().unwrap();

        let range = ex.as_any().downcast_ref::<RangeError>().unwrap();
        assert_eq!(range.limit, 9);
        assert_eq!(range.reason, "out of range");
    }

    #[test]
    fn unknown_exception_slices_to_known_base() {
        let mut factories = FactoryRegistry::default();
        factories.add_exception("::test::DataError", || Box::new(DataError::default()));

        let bytes = marshaled_range_error();
        let mut is = InputStream::new(&bytes).with_factories(&factories);
        is.start_encapsulation().unwrap();
        let ex = is.read_exception().unwrap();
        is.end_encapsulation().unwrap();

        assert_eq!(UserException::type_id(&*ex), "::test::DataError");
        let base = ex.as_any().downcast_ref::<DataError>().unwrap();
        assert_eq!(base.reason, "out of range");
    }

    #[test]
    fn fully_unknown_exception_reports_most_derived() {
        let factories = FactoryRegistry::default();

        let bytes = marshaled_range_error();
        let mut is = InputStream::new(&bytes).with_factories(&factories);
        is.start_encapsulation().unwrap();
        let err = is.read_exception().err().unwrap();
        assert!(matches!(err, MarshalError::NoValueFactory(id) if id == "::test::RangeError"));
    }

    #[test]
    fn exception_read_must_consume_slice_header() {
        let mut factories = FactoryRegistry::default();
        factories.add_exception("::test::RangeError", || Box::new(InertError));

        let bytes = marshaled_range_error();
        let mut is = InputStream::new(&bytes).with_factories(&factories);
        is.start_encapsulation().unwrap();
        let err = is.read_exception().err().unwrap();
        assert!(matches!(err, MarshalError::StreamMisuse(_)));
    }
}
