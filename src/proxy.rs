//! Python-facing memo objects
//! - `Memo`: dict-like view over the native identity table, keyed by `id()` ints
//! - `KeepList`: list-like view over the memo's keepalive vector
//! - `memo[id(memo)]` yields the KeepList, so `copy._keep_alive` works unchanged

use std::collections::TryReserveError;

use pyo3::exceptions::{PyIndexError, PyKeyError, PyMemoryError, PyTypeError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyTuple};

use crate::ffi;
use crate::keepalive::KeepVector;
use crate::memo::MemoTable;

/// Native identity memo, exposed to `__deepcopy__` hooks and constructible by callers.
#[pyclass(name = "Memo", module = "graphcopy")]
#[derive(Default)]
pub struct MemoObject {
    pub(crate) table: MemoTable<Py<PyAny>>,
    pub(crate) keep: KeepVector<Py<PyAny>>,
    /// `(id, previous value)` for every table write made while a checkpoint is open.
    journal: Vec<(usize, Option<Py<PyAny>>)>,
    open_checkpoints: usize,
}

/// Memo position a failed `__deepcopy__` hook is rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub(crate) keep_len: usize,
    journal_len: usize,
}

/// Values released by a memo operation; dropped only after the memo borrow ends,
/// since their finalizers may call back into the memo.
pub(crate) type Released = Vec<Py<PyAny>>;

fn alloc_error(err: TryReserveError) -> PyErr {
    PyMemoryError::new_err(err.to_string())
}

/// Memo keys are object ids; anything else can never be present.
fn memo_key(key: &Bound<'_, PyAny>) -> Option<usize> {
    key.extract::<usize>().ok()
}

impl MemoObject {
    /// Empty the memo for reuse, giving back memory if one call ballooned it.
    pub(crate) fn reset(&mut self) {
        self.table.clear();
        self.keep.clear();
        self.journal.clear();
        self.open_checkpoints = 0;
        self.table.shrink_if_large();
        self.keep.shrink_if_large();
    }

    #[inline]
    fn journaling(&self) -> bool {
        self.open_checkpoints > 0
    }

    /// Store `id -> value`, returning whatever it displaced.
    pub(crate) fn record(
        &mut self,
        py: Python<'_>,
        id: usize,
        value: Py<PyAny>,
    ) -> Result<Option<Py<PyAny>>, TryReserveError> {
        if self.journaling() {
            self.journal.try_reserve(1)?;
        }
        let displaced = self.table.insert(id, value)?;
        if self.journaling() {
            self.journal
                .push((id, displaced.as_ref().map(|old| old.clone_ref(py))));
        }
        Ok(displaced)
    }

    /// Remove `id`, returning its value if it was present.
    pub(crate) fn discard(&mut self, py: Python<'_>, id: usize) -> Option<Py<PyAny>> {
        let removed = self.table.remove(id)?;
        if self.journaling() && self.journal.try_reserve(1).is_ok() {
            self.journal.push((id, Some(removed.clone_ref(py))));
        }
        Some(removed)
    }

    pub(crate) fn open_checkpoint(&mut self) -> Checkpoint {
        self.open_checkpoints += 1;
        Checkpoint {
            keep_len: self.keep.len(),
            journal_len: self.journal.len(),
        }
    }

    /// Keep everything written since the innermost checkpoint.
    pub(crate) fn commit(&mut self) -> Released {
        self.open_checkpoints = self.open_checkpoints.saturating_sub(1);
        if self.journaling() {
            return Released::new();
        }
        self.journal.drain(..).filter_map(|(_, old)| old).collect()
    }

    /// Undo every table write and keepalive append made since `checkpoint`.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) -> Released {
        self.open_checkpoints = self.open_checkpoints.saturating_sub(1);
        let start = checkpoint.journal_len.min(self.journal.len());
        let undo: Vec<_> = self.journal.drain(start..).collect();
        let mut released: Released = self.keep.truncate(checkpoint.keep_len).collect();
        for (id, previous) in undo.into_iter().rev() {
            let current = match previous {
                Some(old) => self.table.insert(id, old).unwrap_or(None),
                None => self.table.remove(id),
            };
            released.extend(current);
        }
        if !self.journaling() {
            released.extend(self.journal.drain(..).filter_map(|(_, old)| old));
        }
        released
    }

    fn keep_list(slf: &Bound<'_, Self>) -> PyResult<Py<KeepList>> {
        Py::new(
            slf.py(),
            KeepList {
                memo: slf.clone().unbind(),
            },
        )
    }

    /// Snapshot as a plain dict following the stdlib memo convention.
    pub(crate) fn to_dict<'py>(slf: &Bound<'py, Self>) -> PyResult<Bound<'py, PyDict>> {
        let py = slf.py();
        let memo = slf.try_borrow()?;
        let dict = PyDict::new(py);
        for (key, value) in memo.table.iter() {
            dict.set_item(key, value.bind(py))?;
        }
        let keep = PyList::empty(py);
        for item in memo.keep.iter() {
            keep.append(item.bind(py))?;
        }
        dict.set_item(dict.as_ptr() as usize, keep)?;
        Ok(dict)
    }
}

#[pymethods]
impl MemoObject {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    fn __len__(&self) -> usize {
        self.table.len()
    }

    fn __contains__(slf: &Bound<'_, Self>, key: &Bound<'_, PyAny>) -> PyResult<bool> {
        Ok(match memo_key(key) {
            Some(id) if id == slf.as_ptr() as usize => true,
            Some(id) => slf.try_borrow()?.table.contains(id),
            None => false,
        })
    }

    fn __getitem__(slf: &Bound<'_, Self>, key: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        let py = slf.py();
        match memo_key(key) {
            Some(id) if id == slf.as_ptr() as usize => Ok(Self::keep_list(slf)?.into_any()),
            Some(id) => slf
                .try_borrow()?
                .table
                .lookup(id)
                .map(|value| value.clone_ref(py))
                .ok_or_else(|| PyKeyError::new_err(key.clone().unbind())),
            None => Err(PyKeyError::new_err(key.clone().unbind())),
        }
    }

    fn __setitem__(
        slf: &Bound<'_, Self>,
        key: &Bound<'_, PyAny>,
        value: &Bound<'_, PyAny>,
    ) -> PyResult<()> {
        let Some(id) = memo_key(key) else {
            return Err(PyTypeError::new_err("memo keys must be object ids (int)"));
        };
        if id == slf.as_ptr() as usize {
            // memo[id(memo)] = [...]: adopt the items as keepalive entries.
            let iter = unsafe { ffi::owned(slf.py(), ffi::PyObject_GetIter(value.as_ptr()))? };
            while let Some(item) = ffi::iter_next(&iter)? {
                slf.try_borrow_mut()?
                    .keep
                    .append(item.unbind())
                    .map_err(alloc_error)?;
            }
            return Ok(());
        }
        let displaced = slf
            .try_borrow_mut()?
            .record(slf.py(), id, value.clone().unbind())
            .map_err(alloc_error)?;
        // Released after the borrow ends: its finalizer may touch this memo.
        drop(displaced);
        Ok(())
    }

    fn __delitem__(slf: &Bound<'_, Self>, key: &Bound<'_, PyAny>) -> PyResult<()> {
        let removed = match memo_key(key) {
            Some(id) => slf.try_borrow_mut()?.discard(slf.py(), id),
            None => None,
        };
        match removed {
            Some(value) => {
                drop(value);
                Ok(())
            }
            None => Err(PyKeyError::new_err(key.clone().unbind())),
        }
    }

    fn __iter__(slf: &Bound<'_, Self>) -> PyResult<Py<PyAny>> {
        let keys = Self::keys(slf)?;
        let iter = unsafe { ffi::owned(slf.py(), ffi::PyObject_GetIter(keys.as_ptr()))? };
        Ok(iter.unbind())
    }

    fn __repr__(&self) -> String {
        format!(
            "<graphcopy.Memo with {} entries, {} kept alive>",
            self.table.len(),
            self.keep.len()
        )
    }

    #[pyo3(signature = (key, default=None))]
    fn get(
        slf: &Bound<'_, Self>,
        key: &Bound<'_, PyAny>,
        default: Option<Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let py = slf.py();
        match memo_key(key) {
            Some(id) if id == slf.as_ptr() as usize => Ok(Self::keep_list(slf)?.into_any()),
            Some(id) => match slf.try_borrow()?.table.lookup(id) {
                Some(value) => Ok(value.clone_ref(py)),
                None => Ok(default.unwrap_or_else(|| py.None())),
            },
            None => Ok(default.unwrap_or_else(|| py.None())),
        }
    }

    #[pyo3(signature = (key, default=None))]
    fn setdefault(
        slf: &Bound<'_, Self>,
        key: &Bound<'_, PyAny>,
        default: Option<Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let py = slf.py();
        let Some(id) = memo_key(key) else {
            return Err(PyTypeError::new_err("memo keys must be object ids (int)"));
        };
        if id == slf.as_ptr() as usize {
            return Ok(Self::keep_list(slf)?.into_any());
        }
        if let Some(value) = slf.try_borrow()?.table.lookup(id) {
            return Ok(value.clone_ref(py));
        }
        let value = default.unwrap_or_else(|| py.None());
        slf.try_borrow_mut()?
            .record(py, id, value.clone_ref(py))
            .map_err(alloc_error)?;
        Ok(value)
    }

    fn keys<'py>(slf: &Bound<'py, Self>) -> PyResult<Bound<'py, PyList>> {
        let memo = slf.try_borrow()?;
        let keys: Vec<usize> = memo.table.iter().map(|(key, _)| key).collect();
        PyList::new(slf.py(), keys)
    }

    fn values<'py>(slf: &Bound<'py, Self>) -> PyResult<Bound<'py, PyList>> {
        let py = slf.py();
        let memo = slf.try_borrow()?;
        let values: Vec<_> = memo.table.iter().map(|(_, value)| value.bind(py)).collect();
        PyList::new(py, values)
    }

    fn items<'py>(slf: &Bound<'py, Self>) -> PyResult<Bound<'py, PyList>> {
        let py = slf.py();
        let memo = slf.try_borrow()?;
        let items = PyList::empty(py);
        for (key, value) in memo.table.iter() {
            let key = key.into_pyobject(py)?.into_any();
            items.append(PyTuple::new(py, [key, value.bind(py).clone()])?)?;
        }
        Ok(items)
    }

    fn clear(slf: &Bound<'_, Self>) -> PyResult<()> {
        let py = slf.py();
        let mut memo = slf.try_borrow_mut()?;
        if memo.journaling() {
            // Entries stay restorable and their sources stay alive until the checkpoint closes.
            let ids: Vec<usize> = memo.table.iter().map(|(id, _)| id).collect();
            let released: Released = ids.into_iter().filter_map(|id| memo.discard(py, id)).collect();
            drop(memo);
            drop(released);
            return Ok(());
        }
        let table = std::mem::take(&mut memo.table);
        let keep = std::mem::take(&mut memo.keep);
        drop(memo);
        drop((table, keep));
        Ok(())
    }

    fn keep(slf: &Bound<'_, Self>) -> PyResult<Py<KeepList>> {
        Self::keep_list(slf)
    }
}

/// List-like proxy over a memo's keepalive vector.
#[pyclass(name = "KeepList", module = "graphcopy")]
pub struct KeepList {
    memo: Py<MemoObject>,
}

#[pymethods]
impl KeepList {
    fn __len__(&self, py: Python<'_>) -> PyResult<usize> {
        Ok(self.memo.bind(py).try_borrow()?.keep.len())
    }

    fn __getitem__(&self, py: Python<'_>, index: isize) -> PyResult<Py<PyAny>> {
        let memo = self.memo.bind(py).try_borrow()?;
        let len = memo.keep.len() as isize;
        let idx = if index < 0 { len + index } else { index };
        if idx < 0 || idx >= len {
            return Err(PyIndexError::new_err("index out of range"));
        }
        memo.keep
            .get(idx as usize)
            .map(|item| item.clone_ref(py))
            .ok_or_else(|| PyIndexError::new_err("index out of range"))
    }

    fn __iter__(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let memo = self.memo.bind(py).try_borrow()?;
        let items = PyList::new(py, memo.keep.iter().map(|item| item.bind(py)))?;
        drop(memo);
        let iter = unsafe { ffi::owned(py, ffi::PyObject_GetIter(items.as_ptr()))? };
        Ok(iter.unbind())
    }

    fn __repr__(&self, py: Python<'_>) -> PyResult<String> {
        Ok(format!(
            "<graphcopy.KeepList with {} items>",
            self.memo.bind(py).try_borrow()?.keep.len()
        ))
    }

    fn append(&self, py: Python<'_>, item: &Bound<'_, PyAny>) -> PyResult<()> {
        self.memo
            .bind(py)
            .try_borrow_mut()?
            .keep
            .append(item.clone().unbind())
            .map_err(alloc_error)
    }

    fn clear(&self, py: Python<'_>) -> PyResult<()> {
        let mut memo = self.memo.bind(py).try_borrow_mut()?;
        let keep = std::mem::take(&mut memo.keep);
        drop(memo);
        drop(keep);
        Ok(())
    }
}
