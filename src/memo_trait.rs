//! Memo trait for compile-time polymorphism over memo implementations

use pyo3::prelude::*;

use crate::error::CloneResult;

/// Identity key of an object: its address, the same value `id()` reports.
#[inline(always)]
pub fn identity(obj: &Bound<'_, PyAny>) -> usize {
    obj.as_ptr() as usize
}

/// Implemented by the native memo (`NativeMemo`) and the dict-protocol memo (`DictMemo`).
///
/// The whole engine is generic over this trait, so each memo flavour gets its own
/// monomorphized traversal.
pub trait Memo<'py> {
    fn py(&self) -> Python<'py>;

    /// Copy previously produced for the object with identity `key`.
    fn lookup(&mut self, key: usize) -> CloneResult<Option<Bound<'py, PyAny>>>;

    /// Record `source -> copy`; also keeps `source` alive unless nothing was duplicated.
    fn insert(&mut self, source: &Bound<'py, PyAny>, copy: &Bound<'py, PyAny>) -> CloneResult<()>;

    /// Undo an `insert` after a failure. Missing keys are ignored.
    fn forget(&mut self, key: usize);

    fn keep_alive(&mut self, obj: &Bound<'py, PyAny>) -> CloneResult<()>;

    /// Invoke a `__deepcopy__` hook with whatever object represents this memo in Python.
    fn call_hook(&mut self, hook: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>>;
}
