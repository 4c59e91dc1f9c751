//! Type classification for dispatch
//!
//! Exact-type pointer comparisons only: no allocation, no user code. Subclasses of
//! the well-known containers are deliberately *not* matched; they go through hooks
//! and the reduce protocol like any other user type.

use std::ptr::addr_of_mut;
use std::sync::OnceLock;

use pyo3::prelude::*;

use crate::ffi::{self, PyTypeObject};
use crate::module_state::ModuleState;

/// Cached type pointers for fast exact-type checks
struct TypeCache {
    dict: *mut PyTypeObject,
    list: *mut PyTypeObject,
    tuple: *mut PyTypeObject,
    set: *mut PyTypeObject,
    frozenset: *mut PyTypeObject,
    bytearray: *mut PyTypeObject,
    method: *mut PyTypeObject,
    long: *mut PyTypeObject,
    float: *mut PyTypeObject,
    unicode: *mut PyTypeObject,
    bytes: *mut PyTypeObject,
    bool_: *mut PyTypeObject,
    complex: *mut PyTypeObject,
    range: *mut PyTypeObject,
    function: *mut PyTypeObject,
    cfunction: *mut PyTypeObject,
    property: *mut PyTypeObject,
    code: *mut PyTypeObject,
    module: *mut PyTypeObject,
    slice: *mut PyTypeObject,
}

// SAFETY: We're just holding pointers to static Python type objects
unsafe impl Send for TypeCache {}
unsafe impl Sync for TypeCache {}

static TYPE_CACHE: OnceLock<TypeCache> = OnceLock::new();

#[inline(always)]
fn cache() -> &'static TypeCache {
    TYPE_CACHE.get_or_init(|| {
        TypeCache {
            dict: addr_of_mut!(ffi::PyDict_Type),
            list: addr_of_mut!(ffi::PyList_Type),
            tuple: addr_of_mut!(ffi::PyTuple_Type),
            set: addr_of_mut!(ffi::PySet_Type),
            frozenset: addr_of_mut!(ffi::PyFrozenSet_Type),
            bytearray: addr_of_mut!(ffi::PyByteArray_Type),
            method: addr_of_mut!(ffi::PyMethod_Type),
            long: addr_of_mut!(ffi::PyLong_Type),
            float: addr_of_mut!(ffi::PyFloat_Type),
            unicode: addr_of_mut!(ffi::PyUnicode_Type),
            bytes: addr_of_mut!(ffi::PyBytes_Type),
            bool_: addr_of_mut!(ffi::PyBool_Type),
            complex: addr_of_mut!(ffi::PyComplex_Type),
            range: addr_of_mut!(ffi::PyRange_Type),
            function: addr_of_mut!(ffi::PyFunction_Type),
            cfunction: addr_of_mut!(ffi::PyCFunction_Type),
            property: addr_of_mut!(ffi::PyProperty_Type),
            code: addr_of_mut!(ffi::PyCode_Type),
            module: addr_of_mut!(ffi::PyModule_Type),
            slice: addr_of_mut!(ffi::PySlice_Type),
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    /// None, bool, int, float, str, bytes: returned as-is without touching the memo.
    AtomicImmutable,
    Sequence,
    Tuple,
    Mapping,
    Set,
    FrozenSet,
    ByteBuffer,
    BoundCallable,
    /// Classes themselves (any `type` subclass instance).
    ClassLike,
    /// Copied by reference, but only after the memo probe.
    OpaqueImmutable,
    Generic,
}

/// Literal immutables: the only values that skip the memo entirely.
#[inline(always)]
pub fn is_atomic_immutable(obj: &Bound<'_, PyAny>) -> bool {
    let ptr = obj.as_ptr();
    let tp = ffi::type_of(obj);
    let cache = cache();
    (unsafe { ptr == ffi::Py_None() })
        || tp == cache.long
        || tp == cache.unicode
        || tp == cache.bool_
        || tp == cache.float
        || tp == cache.bytes
}

/// Classify object type ONCE
#[inline]
pub fn classify(obj: &Bound<'_, PyAny>, state: &ModuleState) -> TypeClass {
    if is_atomic_immutable(obj) {
        return TypeClass::AtomicImmutable;
    }

    let tp = ffi::type_of(obj);
    let cache = cache();

    // Exact type checks (hot path)
    if tp == cache.dict {
        return TypeClass::Mapping;
    }
    if tp == cache.list {
        return TypeClass::Sequence;
    }
    if tp == cache.tuple {
        return TypeClass::Tuple;
    }
    if tp == cache.set {
        return TypeClass::Set;
    }
    if tp == cache.frozenset {
        return TypeClass::FrozenSet;
    }
    if tp == cache.bytearray {
        return TypeClass::ByteBuffer;
    }
    if tp == cache.method {
        return TypeClass::BoundCallable;
    }

    if unsafe { ffi::PyType_HasFeature(tp, ffi::Py_TPFLAGS_TYPE_SUBCLASS) } != 0 {
        return TypeClass::ClassLike;
    }

    if is_opaque_immutable(obj, tp, state) {
        return TypeClass::OpaqueImmutable;
    }

    TypeClass::Generic
}

fn is_opaque_immutable(obj: &Bound<'_, PyAny>, tp: *mut PyTypeObject, state: &ModuleState) -> bool {
    let cache = cache();
    let ptr = obj.as_ptr();
    tp == cache.range
        || tp == cache.function
        || tp == cache.cfunction
        || tp == cache.property
        || tp == cache.code
        || tp == cache.module
        || tp == cache.complex
        || unsafe { ptr == ffi::Py_NotImplemented() || ptr == ffi::Py_Ellipsis() }
        || state.is_runtime_immutable_type(tp.cast())
}

/// Values `copy()` hands back untouched: everything immutable plus tuples,
/// slices, frozensets and classes.
pub fn is_shallow_immutable(obj: &Bound<'_, PyAny>, state: &ModuleState) -> bool {
    let tp = ffi::type_of(obj);
    let cache = cache();
    is_atomic_immutable(obj)
        || tp == cache.tuple
        || tp == cache.slice
        || tp == cache.frozenset
        || unsafe { ffi::PyType_HasFeature(tp, ffi::Py_TPFLAGS_TYPE_SUBCLASS) } != 0
        || is_opaque_immutable(obj, tp, state)
}

/// Exact dict, list, set or bytearray (the types `copy()` delegates to `.copy()` for).
pub fn is_copyable_builtin_container(obj: &Bound<'_, PyAny>) -> bool {
    let tp = ffi::type_of(obj);
    let cache = cache();
    tp == cache.dict || tp == cache.list || tp == cache.set || tp == cache.bytearray
}
