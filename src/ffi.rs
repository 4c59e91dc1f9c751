//! Raw CPython C-API surface used on hot paths
//! - Re-exports pyo3-ffi wholesale
//! - Declares the few symbols pyo3-ffi does not expose (or exposes only on some versions)
//! - Small adapters from C-API return conventions to `PyResult`

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(non_snake_case)]
#![allow(dead_code)]

pub use pyo3_ffi::*;

use pyo3::prelude::*;
use std::os::raw::c_int;

// Type objects copied by reference; not all of them are re-exported by pyo3-ffi
// on every interpreter version.
extern "C" {
    pub static mut PyCode_Type: PyTypeObject;
    pub static mut PyFunction_Type: PyTypeObject;
    pub static mut PyProperty_Type: PyTypeObject;
    pub static mut PyCFunction_Type: PyTypeObject;
    pub static mut PyMethod_Type: PyTypeObject;

    pub fn PyMethod_New(func: *mut PyObject, self_: *mut PyObject) -> *mut PyObject;
    pub fn Py_GetRecursionLimit() -> c_int;
    /// Empty dict with room for `minused` entries without resizing.
    pub fn _PyDict_NewPresized(minused: Py_ssize_t) -> *mut PyObject;
}

#[cfg(Py_3_14)]
pub const PyDict_EVENT_ADDED: c_int = 0;
#[cfg(Py_3_14)]
pub const PyDict_EVENT_MODIFIED: c_int = 1;
#[cfg(Py_3_14)]
pub const PyDict_EVENT_DELETED: c_int = 2;
#[cfg(Py_3_14)]
pub const PyDict_EVENT_CLONED: c_int = 3;
#[cfg(Py_3_14)]
pub const PyDict_EVENT_CLEARED: c_int = 4;
#[cfg(Py_3_14)]
pub const PyDict_EVENT_DEALLOCATED: c_int = 5;

#[cfg(Py_3_14)]
pub type DictWatchCallback = unsafe extern "C" fn(
    event: c_int,
    dict: *mut PyObject,
    key: *mut PyObject,
    new_value: *mut PyObject,
) -> c_int;

#[cfg(Py_3_14)]
extern "C" {
    pub fn PyDict_AddWatcher(callback: Option<DictWatchCallback>) -> c_int;
    pub fn PyDict_Watch(watcher_id: c_int, dict: *mut PyObject) -> c_int;
    pub fn PyDict_Unwatch(watcher_id: c_int, dict: *mut PyObject) -> c_int;
}

/// Leading fields of `PyDictObject` up to the version tag (3.13 and older layout).
#[cfg(not(Py_3_14))]
#[repr(C)]
pub struct DictHeader {
    pub ob_base: PyObject,
    pub ma_used: Py_ssize_t,
    pub ma_version_tag: u64,
}

/// Read the dict's internal version tag; bumped on every mutation.
#[cfg(not(Py_3_14))]
#[inline(always)]
pub unsafe fn dict_version(dict: *mut PyObject) -> u64 {
    (*(dict as *const DictHeader)).ma_version_tag
}

/// Compute pointer hash using SplitMix64
#[inline(always)]
pub fn hash_pointer(key: usize) -> usize {
    let mut h = key as u64;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd_u64);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53_u64);
    h ^= h >> 33;
    h as usize
}

/// Exact type of an object, no refcount traffic.
#[inline(always)]
pub fn type_of(obj: &Bound<'_, PyAny>) -> *mut PyTypeObject {
    unsafe { Py_TYPE(obj.as_ptr()) }
}

/// Wrap a new reference; NULL becomes the pending exception.
#[inline(always)]
pub unsafe fn owned<'py>(py: Python<'py>, ptr: *mut PyObject) -> PyResult<Bound<'py, PyAny>> {
    Bound::from_owned_ptr_or_err(py, ptr)
}

/// Wrap a borrowed reference (incref).
#[inline(always)]
pub unsafe fn borrowed<'py>(py: Python<'py>, ptr: *mut PyObject) -> Bound<'py, PyAny> {
    Bound::from_borrowed_ptr(py, ptr)
}

/// Map a C-API status code (`-1` on failure) to `PyResult`.
#[inline(always)]
pub fn check(py: Python<'_>, status: c_int) -> PyResult<()> {
    if status < 0 {
        Err(PyErr::fetch(py))
    } else {
        Ok(())
    }
}

/// `PyIter_Next` with the NULL-without-error end marker made explicit.
pub fn iter_next<'py>(iterator: &Bound<'py, PyAny>) -> PyResult<Option<Bound<'py, PyAny>>> {
    let py = iterator.py();
    let item = unsafe { PyIter_Next(iterator.as_ptr()) };
    if item.is_null() {
        match PyErr::take(py) {
            Some(err) => Err(err),
            None => Ok(None),
        }
    } else {
        Ok(Some(unsafe { Bound::from_owned_ptr(py, item) }))
    }
}
