//! Caller-supplied memo (compatibility path)
//!
//! Any mapping passed as `memo=` that is not a native `Memo` is driven through the
//! stdlib convention: keys are `id()` ints and a keepalive list lives under
//! `memo[id(memo)]`. Exact dicts use the dict C-API; other mappings go through
//! `get`/`__setitem__`/`__delitem__`.

use pyo3::exceptions::PyKeyError;
use pyo3::prelude::*;

use crate::error::CloneResult;
use crate::ffi;
use crate::memo_trait::{identity, Memo};
use crate::module_state::ModuleState;

pub struct DictMemo<'py> {
    memo: Bound<'py, PyAny>,
    exact_dict: bool,
    /// `memo[id(memo)]`, fetched or created on first need.
    keep: Option<Bound<'py, PyAny>>,
    state: &'static ModuleState,
}

impl<'py> DictMemo<'py> {
    pub fn new(memo: Bound<'py, PyAny>, state: &'static ModuleState) -> Self {
        let exact_dict = unsafe { ffi::PyDict_CheckExact(memo.as_ptr()) } != 0;
        Self {
            memo,
            exact_dict,
            keep: None,
            state,
        }
    }

    fn key(&self, key: usize) -> PyResult<Bound<'py, PyAny>> {
        unsafe { ffi::owned(self.py(), ffi::PyLong_FromSize_t(key)) }
    }

    fn get(&self, key: usize) -> PyResult<Option<Bound<'py, PyAny>>> {
        let py = self.py();
        let key = self.key(key)?;
        if self.exact_dict {
            let found = unsafe { ffi::PyDict_GetItemWithError(self.memo.as_ptr(), key.as_ptr()) };
            if found.is_null() {
                return match PyErr::take(py) {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }
            return Ok(Some(unsafe { ffi::borrowed(py, found) }));
        }
        let sentinel = self.state.sentinel.bind(py);
        let found = self
            .memo
            .call_method1(pyo3::intern!(py, "get"), (key, sentinel))?;
        if found.as_ptr() == sentinel.as_ptr() {
            Ok(None)
        } else {
            Ok(Some(found))
        }
    }

    fn set(&self, key: usize, value: &Bound<'py, PyAny>) -> PyResult<()> {
        let key = self.key(key)?;
        let status = unsafe { ffi::PyObject_SetItem(self.memo.as_ptr(), key.as_ptr(), value.as_ptr()) };
        ffi::check(self.py(), status)
    }

    fn keep_list(&mut self) -> PyResult<Bound<'py, PyAny>> {
        if let Some(keep) = &self.keep {
            return Ok(keep.clone());
        }
        let memo_id = identity(&self.memo);
        let keep = match self.get(memo_id)? {
            Some(existing) => existing,
            None => {
                let fresh = pyo3::types::PyList::empty(self.py()).into_any();
                self.set(memo_id, &fresh)?;
                fresh
            }
        };
        self.keep = Some(keep.clone());
        Ok(keep)
    }
}

impl<'py> Memo<'py> for DictMemo<'py> {
    #[inline(always)]
    fn py(&self) -> Python<'py> {
        self.memo.py()
    }

    fn lookup(&mut self, key: usize) -> CloneResult<Option<Bound<'py, PyAny>>> {
        Ok(self.get(key)?)
    }

    fn insert(&mut self, source: &Bound<'py, PyAny>, copy: &Bound<'py, PyAny>) -> CloneResult<()> {
        self.set(identity(source), copy)?;
        if source.as_ptr() != copy.as_ptr() {
            self.keep_alive(source)?;
        }
        Ok(())
    }

    fn forget(&mut self, key: usize) {
        let py = self.py();
        let Ok(key) = self.key(key) else {
            return;
        };
        let status = unsafe { ffi::PyObject_DelItem(self.memo.as_ptr(), key.as_ptr()) };
        if let Err(err) = ffi::check(py, status) {
            if !err.is_instance_of::<PyKeyError>(py) {
                log::trace!("discarding error while rolling back memo entry: {err}");
            }
        }
    }

    fn keep_alive(&mut self, obj: &Bound<'py, PyAny>) -> CloneResult<()> {
        let keep = self.keep_list()?;
        if unsafe { ffi::PyList_CheckExact(keep.as_ptr()) } != 0 {
            ffi::check(self.py(), unsafe { ffi::PyList_Append(keep.as_ptr(), obj.as_ptr()) })?;
        } else {
            keep.call_method1(pyo3::intern!(self.py(), "append"), (obj,))?;
        }
        Ok(())
    }

    fn call_hook(&mut self, hook: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>> {
        Ok(hook.call1((&self.memo,))?)
    }
}
