//! Polymorphic value and user-exception model.
//!
//! Values are reference types: a decoded graph preserves sharing and
//! cycles, so instances live behind `Rc<RefCell<..>>` handles. A value
//! describes its own ancestor chain by writing one slice per level,
//! most-derived first; receivers that lack a factory for the
//! most-derived type keep the unrecognized slices as [`SlicedData`] and
//! can re-marshal them byte-faithfully.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::MarshalError;
use crate::stream::{InputStream, OutputStream};

/// Shared handle to a decoded or to-be-encoded value instance.
pub type ValueRef = Rc<RefCell<dyn Value>>;

/// Identity of a value instance for the write-side instance table.
///
/// Identity is pointer identity, never structural equality: two equal
/// nodes marshal as two instances, the same node marshals once.
pub(crate) fn value_ptr(v: &ValueRef) -> usize {
    Rc::as_ptr(v) as *const () as usize
}

/// A polymorphic class instance that can be marshaled slice-by-slice.
pub trait Value: Any {
    /// The most-derived type id, e.g. `"::demo::Derived"`.
    fn type_id(&self) -> &'static str;

    /// Optional numeric alias for the type id.
    fn compact_id(&self) -> Option<i32> {
        None
    }

    /// Write every slice of the ancestor chain, most-derived first.
    ///
    /// Implementations call [`OutputStream::start_slice`] and
    /// [`OutputStream::end_slice`] once per level that contributes
    /// members, flagging the last level.
    fn write(&self, os: &mut OutputStream) -> Result<(), MarshalError>;

    /// Read the slices this type knows about, most-derived first.
    ///
    /// Implementations call [`InputStream::start_slice`] and
    /// [`InputStream::end_slice`] once per level. Member value
    /// references are delivered through deferred patch closures, so an
    /// implementation needs its own handle (`self_ref`) to store them.
    fn read(
        &mut self,
        is: &mut InputStream<'_>,
        self_ref: &ValueRef,
    ) -> Result<(), MarshalError>;

    /// Unrecognized trailing slices retained from decoding, if any.
    fn sliced_data(&self) -> Option<&SlicedData> {
        None
    }

    /// Attach unrecognized trailing slices captured during decoding.
    fn set_sliced_data(&mut self, _data: SlicedData) {}

    /// Mutable access to preserved slices. The decoder uses this to
    /// fill indirection entries that referenced instances still being
    /// read. Types that preserve slices implement all three accessors.
    fn sliced_data_mut(&mut self) -> Option<&mut SlicedData> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ── Sliced data ──────────────────────────────────────────────────

/// One preserved slice of an instance whose type the receiver did not
/// recognize.
#[derive(Clone)]
pub struct SliceInfo {
    /// Wire type id of this slice ("" when only a compact id was sent).
    pub type_id: String,
    /// Compact numeric type id, when the sender used one.
    pub compact_id: Option<i32>,
    /// Raw member bytes, excluding header and indirection table.
    pub bytes: Vec<u8>,
    /// Instances referenced by this slice through its indirection table.
    pub instances: Vec<Option<ValueRef>>,
    /// Whether this was the last slice of the instance.
    pub is_last: bool,
}

impl std::fmt::Debug for SliceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceInfo")
            .field("type_id", &self.type_id)
            .field("compact_id", &self.compact_id)
            .field("bytes", &self.bytes.len())
            .field("instances", &self.instances.len())
            .field("is_last", &self.is_last)
            .finish()
    }
}

/// The ordered set of unrecognized slices retained for an instance,
/// outermost (most-derived) first.
///
/// Owned by the instance it was read into; re-marshaling the instance
/// re-emits these slices byte-faithfully ahead of any known slices.
#[derive(Clone, Debug, Default)]
pub struct SlicedData {
    pub slices: Vec<SliceInfo>,
}

impl SlicedData {
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

// ── Unknown sliced value ─────────────────────────────────────────

/// Placeholder for an instance whose most-derived type (and every
/// ancestor) is unknown to the receiver.
///
/// Carries all slices opaquely so a pass-through intermediary can
/// forward the instance verbatim.
pub struct UnknownSlicedValue {
    type_id: String,
    data: SlicedData,
}

impl UnknownSlicedValue {
    pub fn new(type_id: String) -> Self {
        UnknownSlicedValue {
            type_id,
            data: SlicedData::default(),
        }
    }

    /// The most-derived wire type id this placeholder stands in for.
    pub fn unknown_type_id(&self) -> &str {
        &self.type_id
    }
}

impl Value for UnknownSlicedValue {
    fn type_id(&self) -> &'static str {
        "::orb::UnknownSlicedValue"
    }

    fn write(&self, os: &mut OutputStream) -> Result<(), MarshalError> {
        os.write_sliced_data(&self.data)
    }

    fn read(
        &mut self,
        _is: &mut InputStream<'_>,
        _self_ref: &ValueRef,
    ) -> Result<(), MarshalError> {
        // All slices of an unknown value are consumed by the decoder
        // itself and delivered via set_sliced_data.
        Ok(())
    }

    fn sliced_data(&self) -> Option<&SlicedData> {
        Some(&self.data)
    }

    fn set_sliced_data(&mut self, data: SlicedData) {
        self.data = data;
    }

    fn sliced_data_mut(&mut self) -> Option<&mut SlicedData> {
        Some(&mut self.data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ── User exceptions ──────────────────────────────────────────────

/// A user exception hierarchy marshaled slice-by-slice, like values
/// but without cross-instance identity (exceptions are never shared).
pub trait UserException: Any {
    fn type_id(&self) -> &'static str;

    /// Write every slice, most-derived first, via
    /// `start_slice`/`end_slice`.
    fn write(&self, os: &mut OutputStream) -> Result<(), MarshalError>;

    /// Read known slices, most-derived first.
    fn read(&mut self, is: &mut InputStream<'_>) -> Result<(), MarshalError>;

    fn as_any(&self) -> &dyn Any;
}

// ── Factories ────────────────────────────────────────────────────

type ValueFactory = Box<dyn Fn() -> ValueRef + Send + Sync>;
type ExceptionFactory = Box<dyn Fn() -> Box<dyn UserException> + Send + Sync>;

/// Registry mapping wire type ids (and compact ids) to instance
/// factories.
///
/// Scoped to whoever decodes: each `InputStream` borrows one registry
/// for its lifetime. Lookup misses do not fail here — the decoder
/// decides between slicing and `NoValueFactory`.
#[derive(Default)]
pub struct FactoryRegistry {
    values: HashMap<&'static str, ValueFactory>,
    compact: HashMap<i32, ValueFactory>,
    exceptions: HashMap<&'static str, ExceptionFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value factory under its wire type id.
    pub fn add_value<F>(&mut self, type_id: &'static str, factory: F)
    where
        F: Fn() -> ValueRef + Send + Sync + 'static,
    {
        self.values.insert(type_id, Box::new(factory));
    }

    /// Register a value factory under a compact numeric id.
    pub fn add_compact<F>(&mut self, id: i32, factory: F)
    where
        F: Fn() -> ValueRef + Send + Sync + 'static,
    {
        self.compact.insert(id, Box::new(factory));
    }

    /// Register a user-exception factory under its wire type id.
    pub fn add_exception<F>(&mut self, type_id: &'static str, factory: F)
    where
        F: Fn() -> Box<dyn UserException> + Send + Sync + 'static,
    {
        self.exceptions.insert(type_id, Box::new(factory));
    }

    pub fn create_value(&self, type_id: &str) -> Option<ValueRef> {
        self.values.get(type_id).map(|f| f())
    }

    pub fn create_compact(&self, id: i32) -> Option<ValueRef> {
        self.compact.get(&id).map(|f| f())
    }

    pub fn create_exception(&self, type_id: &str) -> Option<Box<dyn UserException>> {
        self.exceptions.get(type_id).map(|f| f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Value for Plain {
        fn type_id(&self) -> &'static str {
            "::test::Plain"
        }
        fn write(&self, _os: &mut OutputStream) -> Result<(), MarshalError> {
            Ok(())
        }
        fn read(
            &mut self,
            _is: &mut InputStream<'_>,
            _self_ref: &ValueRef,
        ) -> Result<(), MarshalError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn downcast_through_as_any() {
        let v: ValueRef = Rc::new(RefCell::new(Plain));
        let guard = v.borrow();
        assert!(guard.as_any().downcast_ref::<Plain>().is_some());
        assert!(guard.as_any().downcast_ref::<UnknownSlicedValue>().is_none());
    }

    #[test]
    fn registry_lookup() {
        let mut reg = FactoryRegistry::new();
        reg.add_value("::test::Plain", || Rc::new(RefCell::new(Plain)));
        assert!(reg.create_value("::test::Plain").is_some());
        assert!(reg.create_value("::test::Other").is_none());
    }

    #[test]
    fn pointer_identity_not_structural() {
        let a: ValueRef = Rc::new(RefCell::new(Plain));
        let b: ValueRef = Rc::new(RefCell::new(Plain));
        assert_ne!(value_ptr(&a), value_ptr(&b));
        assert_eq!(value_ptr(&a), value_ptr(&a.clone()));
    }
}
