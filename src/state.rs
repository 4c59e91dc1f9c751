//! Per-thread memo pool
//!
//! Pattern:
//! 1. One `Memo` object parked per thread
//! 2. `checkout` takes it (or allocates a fresh one when the slot is empty)
//! 3. On give-back the refcount is checked: exactly one owner means nobody kept a
//!    reference, so it is cleared and parked again; anything more means the memo
//!    escaped into user state and is detached instead of being mutated under it

use std::cell::RefCell;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};

use crate::error::CloneResult;
use crate::ffi;
use crate::memo_trait::{identity, Memo};
use crate::proxy::{Checkpoint, MemoObject};

/// Engine-side handle on a native `Memo` object.
pub struct NativeMemo<'py> {
    memo: Bound<'py, MemoObject>,
}

impl<'py> NativeMemo<'py> {
    pub fn new(memo: Bound<'py, MemoObject>) -> Self {
        Self { memo }
    }

    pub fn object(&self) -> &Bound<'py, MemoObject> {
        &self.memo
    }

    /// Open a checkpoint; every memo write after it can be undone with `rollback`.
    pub fn checkpoint(&mut self) -> CloneResult<Checkpoint> {
        Ok(self.memo.try_borrow_mut().map_err(PyErr::from)?.open_checkpoint())
    }

    /// Close the innermost checkpoint, keeping what was written since.
    pub fn commit(&mut self) {
        let Ok(mut memo) = self.memo.try_borrow_mut() else {
            return;
        };
        let released = memo.commit();
        drop(memo);
        drop(released);
    }

    /// Restore the memo to the state it had at `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let Ok(mut memo) = self.memo.try_borrow_mut() else {
            return;
        };
        let released = memo.rollback(checkpoint);
        drop(memo);
        drop(released);
    }

    /// Make the native memo match a dict snapshot a hook worked on (see `MemoObject::to_dict`).
    ///
    /// The dict is authoritative: changed ids are overwritten, ids the hook deleted
    /// are dropped, and keepalive items past `keep_len` are adopted.
    pub fn absorb_dict(&mut self, dict: &Bound<'py, PyDict>, keep_len: usize) -> CloneResult<()> {
        let py = self.py();
        let dict_id = dict.as_ptr() as usize;
        let mut entries = Vec::new();
        let mut kept = None;
        for (key, value) in dict.iter() {
            match key.extract::<usize>() {
                Ok(id) if id == dict_id => kept = value.extract::<Bound<'py, PyList>>().ok(),
                Ok(id) => entries.push((id, value)),
                Err(_) => {}
            }
        }

        let present: HashSet<usize> = entries.iter().map(|(id, _)| *id).collect();
        let mut released = Vec::new();
        let mut memo = self.memo.try_borrow_mut().map_err(PyErr::from)?;
        let stale: Vec<usize> = memo
            .table
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !present.contains(id))
            .collect();
        released.extend(stale.into_iter().filter_map(|id| memo.discard(py, id)));
        for (id, value) in entries {
            let unchanged = memo
                .table
                .lookup(id)
                .is_some_and(|current| current.as_ptr() == value.as_ptr());
            if !unchanged {
                released.extend(memo.record(py, id, value.unbind())?);
            }
        }
        if let Some(kept) = kept {
            for item in kept.iter().skip(keep_len) {
                memo.keep.append(item.unbind())?;
            }
        }
        drop(memo);
        drop(released);
        Ok(())
    }
}

impl<'py> Memo<'py> for NativeMemo<'py> {
    #[inline(always)]
    fn py(&self) -> Python<'py> {
        self.memo.py()
    }

    #[inline]
    fn lookup(&mut self, key: usize) -> CloneResult<Option<Bound<'py, PyAny>>> {
        let py = self.py();
        let memo = self.memo.try_borrow().map_err(PyErr::from)?;
        Ok(memo.table.lookup(key).map(|copy| copy.bind(py).clone()))
    }

    #[inline]
    fn insert(&mut self, source: &Bound<'py, PyAny>, copy: &Bound<'py, PyAny>) -> CloneResult<()> {
        let py = self.py();
        let displaced = {
            let mut memo = self.memo.try_borrow_mut().map_err(PyErr::from)?;
            let displaced = memo.record(py, identity(source), copy.clone().unbind())?;
            if source.as_ptr() != copy.as_ptr() {
                memo.keep.append(source.clone().unbind())?;
            }
            displaced
        };
        drop(displaced);
        Ok(())
    }

    fn forget(&mut self, key: usize) {
        let py = self.py();
        let removed = match self.memo.try_borrow_mut() {
            Ok(mut memo) => memo.discard(py, key),
            Err(_) => None,
        };
        drop(removed);
    }

    fn keep_alive(&mut self, obj: &Bound<'py, PyAny>) -> CloneResult<()> {
        let mut memo = self.memo.try_borrow_mut().map_err(PyErr::from)?;
        memo.keep.append(obj.clone().unbind())?;
        Ok(())
    }

    fn call_hook(&mut self, hook: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>> {
        crate::fallback::call_hook(hook, self)
    }
}

thread_local! {
    static POOL: RefCell<Option<Py<MemoObject>>> = const { RefCell::new(None) };
}

/// A memo checked out of this thread's pool; handed back on drop.
pub struct PooledMemo<'py> {
    memo: NativeMemo<'py>,
}

impl<'py> PooledMemo<'py> {
    pub fn checkout(py: Python<'py>) -> PyResult<Self> {
        let parked = POOL
            .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
            .ok()
            .flatten();
        let memo = match parked {
            Some(memo) => memo.into_bound(py),
            None => Bound::new(py, MemoObject::default())?,
        };
        Ok(Self {
            memo: NativeMemo::new(memo),
        })
    }
}

impl<'py> Deref for PooledMemo<'py> {
    type Target = NativeMemo<'py>;

    fn deref(&self) -> &Self::Target {
        &self.memo
    }
}

impl<'py> DerefMut for PooledMemo<'py> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.memo
    }
}

impl Drop for PooledMemo<'_> {
    fn drop(&mut self) {
        let memo = self.memo.object();
        if unsafe { ffi::Py_REFCNT(memo.as_ptr()) } != 1 {
            log::debug!("memo is referenced outside the pool; detaching it");
            return;
        }
        match memo.try_borrow_mut() {
            Ok(mut inner) => inner.reset(),
            Err(_) => return,
        }
        let parked = memo.clone().unbind();
        let _ = POOL.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = Some(parked);
            }
        });
    }
}
