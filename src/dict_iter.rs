//! Mutation-safe iteration over a dict being copied
//!
//! `__deepcopy__` hooks and finalizers run while we walk a dict and may mutate it.
//! Mutation is detected instead of trusting `PyDict_Next` over a changed table:
//! - up to 3.13: the dict's internal version tag is snapshotted and re-read per step
//! - 3.14+: a dict watcher flags every active guard on this thread watching that dict
//!
//! Either way the error distinguishes "changed size" from "keys changed".

use pyo3::prelude::*;

use crate::error::{CloneError, CloneResult, MutationKind};
use crate::ffi;

pub struct DictIter<'py> {
    dict: Bound<'py, PyAny>,
    pos: ffi::Py_ssize_t,
    size0: ffi::Py_ssize_t,
    finished: bool,
    #[cfg(not(Py_3_14))]
    version0: u64,
    #[cfg(Py_3_14)]
    watch: watch::Registration,
}

impl<'py> DictIter<'py> {
    /// `dict` must be an exact dict (checked by the caller's classification).
    pub fn new(dict: &Bound<'py, PyAny>) -> Self {
        let ptr = dict.as_ptr();
        let size0 = unsafe { ffi::PyDict_Size(ptr) };
        Self {
            dict: dict.clone(),
            pos: 0,
            size0,
            finished: false,
            #[cfg(not(Py_3_14))]
            version0: unsafe { ffi::dict_version(ptr) },
            #[cfg(Py_3_14)]
            watch: watch::Registration::new(dict.py(), ptr, size0),
        }
    }

    fn size_kind(&self) -> MutationKind {
        let now = unsafe { ffi::PyDict_Size(self.dict.as_ptr()) };
        if now != self.size0 {
            MutationKind::SizeChanged
        } else {
            MutationKind::KeysChanged
        }
    }

    #[cfg(not(Py_3_14))]
    fn mutation(&self) -> Option<MutationKind> {
        let version = unsafe { ffi::dict_version(self.dict.as_ptr()) };
        (version != self.version0).then(|| self.size_kind())
    }

    #[cfg(Py_3_14)]
    fn mutation(&self) -> Option<MutationKind> {
        match self.watch.flags() {
            Some(watch::Flags { mutated: false, .. }) => None,
            Some(watch::Flags { size_changed, .. }) => Some(match self.size_kind() {
                MutationKind::KeysChanged if size_changed => MutationKind::SizeChanged,
                kind => kind,
            }),
            // Watcher unavailable: only size changes can be seen.
            None => match self.size_kind() {
                MutationKind::SizeChanged => Some(MutationKind::SizeChanged),
                MutationKind::KeysChanged => None,
            },
        }
    }
}

impl<'py> Iterator for DictIter<'py> {
    type Item = CloneResult<(Bound<'py, PyAny>, Bound<'py, PyAny>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut key = std::ptr::null_mut();
        let mut value = std::ptr::null_mut();
        let more =
            unsafe { ffi::PyDict_Next(self.dict.as_ptr(), &mut self.pos, &mut key, &mut value) } != 0;

        if let Some(kind) = self.mutation() {
            self.finished = true;
            return Some(Err(CloneError::dict_mutated(kind)));
        }
        if !more {
            self.finished = true;
            return None;
        }
        let py = self.dict.py();
        Some(Ok(unsafe { (ffi::borrowed(py, key), ffi::borrowed(py, value)) }))
    }
}

#[cfg(Py_3_14)]
mod watch {
    use std::cell::{Cell, RefCell};
    use std::os::raw::c_int;
    use std::sync::OnceLock;

    use pyo3::prelude::*;

    use crate::ffi;

    #[derive(Debug, Clone, Copy)]
    pub struct Flags {
        pub mutated: bool,
        pub size_changed: bool,
    }

    struct Active {
        token: u64,
        dict: usize,
        size0: ffi::Py_ssize_t,
        flags: Flags,
    }

    thread_local! {
        static ACTIVE: RefCell<Vec<Active>> = const { RefCell::new(Vec::new()) };
        static NEXT_TOKEN: Cell<u64> = const { Cell::new(0) };
    }

    static WATCHER_ID: OnceLock<Option<c_int>> = OnceLock::new();

    fn watcher_id(py: Python<'_>) -> Option<c_int> {
        *WATCHER_ID.get_or_init(|| {
            let id = unsafe { ffi::PyDict_AddWatcher(Some(on_dict_event)) };
            if id < 0 {
                let err = PyErr::take(py);
                log::debug!("dict watcher unavailable ({err:?}); falling back to size checks");
                None
            } else {
                Some(id)
            }
        })
    }

    unsafe extern "C" fn on_dict_event(
        event: c_int,
        dict: *mut ffi::PyObject,
        _key: *mut ffi::PyObject,
        _new_value: *mut ffi::PyObject,
    ) -> c_int {
        let _ = ACTIVE.try_with(|active| {
            let Ok(mut active) = active.try_borrow_mut() else {
                return;
            };
            // Every guard on this dict, so reentrant iteration is covered too.
            for guard in active.iter_mut().rev().filter(|g| g.dict == dict as usize) {
                guard.flags.mutated = true;
                let structural = matches!(
                    event,
                    ffi::PyDict_EVENT_ADDED
                        | ffi::PyDict_EVENT_DELETED
                        | ffi::PyDict_EVENT_CLEARED
                        | ffi::PyDict_EVENT_CLONED
                );
                if structural || ffi::PyDict_Size(dict) != guard.size0 {
                    guard.flags.size_changed = true;
                }
            }
        });
        // Raising from a watcher only produces an unraisable warning.
        0
    }

    /// Pushed on the thread's guard stack for the iterator's lifetime.
    pub struct Registration {
        token: u64,
        dict: *mut ffi::PyObject,
        watcher: Option<c_int>,
    }

    impl Registration {
        pub fn new(py: Python<'_>, dict: *mut ffi::PyObject, size0: ffi::Py_ssize_t) -> Self {
            let token = NEXT_TOKEN.with(|next| {
                let token = next.get();
                next.set(token.wrapping_add(1));
                token
            });
            // Push first so a mutation right after `PyDict_Watch` already finds us.
            let _ = ACTIVE.try_with(|active| {
                if let Ok(mut active) = active.try_borrow_mut() {
                    active.push(Active {
                        token,
                        dict: dict as usize,
                        size0,
                        flags: Flags {
                            mutated: false,
                            size_changed: false,
                        },
                    });
                }
            });
            let watcher = watcher_id(py).filter(|&id| {
                if unsafe { ffi::PyDict_Watch(id, dict) } == 0 {
                    true
                } else {
                    let _ = PyErr::take(py);
                    false
                }
            });
            Self {
                token,
                dict,
                watcher,
            }
        }

        /// `None` when no watcher is attached to this dict.
        pub fn flags(&self) -> Option<Flags> {
            self.watcher?;
            ACTIVE
                .try_with(|active| {
                    active
                        .try_borrow()
                        .ok()
                        .and_then(|active| active.iter().rev().find(|g| g.token == self.token).map(|g| g.flags))
                })
                .ok()
                .flatten()
        }
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            let still_watched = ACTIVE
                .try_with(|active| {
                    let Ok(mut active) = active.try_borrow_mut() else {
                        return false;
                    };
                    if let Some(idx) = active.iter().rposition(|g| g.token == self.token) {
                        active.remove(idx);
                    }
                    active.iter().any(|g| g.dict == self.dict as usize)
                })
                .unwrap_or(false);
            if let (Some(id), false) = (self.watcher, still_watched) {
                unsafe { ffi::PyDict_Unwatch(id, self.dict) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::exceptions::PyRuntimeError;
    use pyo3::types::PyDict;

    fn collect(dict: &Bound<'_, PyDict>) -> CloneResult<Vec<(i64, i64)>> {
        DictIter::new(dict.as_any())
            .map(|entry| -> CloneResult<(i64, i64)> {
                let (k, v) = entry?;
                Ok((k.extract::<i64>()?, v.extract::<i64>()?))
            })
            .collect()
    }

    #[test]
    fn yields_entries_in_order() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            for i in 0..5i64 {
                dict.set_item(i, i * 10).unwrap();
            }
            let entries = collect(&dict).unwrap();
            assert_eq!(entries, (0..5).map(|i| (i, i * 10)).collect::<Vec<_>>());
        });
    }

    #[test]
    fn insertion_reports_changed_size() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            dict.set_item(1, 1).unwrap();
            dict.set_item(2, 2).unwrap();
            let mut iter = DictIter::new(dict.as_any());
            assert!(iter.next().unwrap().is_ok());
            dict.set_item(3, 3).unwrap();
            let err = iter.next().unwrap().unwrap_err();
            assert_eq!(err.to_string(), "dictionary changed size during iteration");
            assert!(iter.next().is_none());
            let err: PyErr = err.into();
            assert!(err.is_instance_of::<PyRuntimeError>(py));
        });
    }

    #[test]
    fn swapped_key_reports_keys_changed() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            dict.set_item(1, 1).unwrap();
            dict.set_item(2, 2).unwrap();
            let mut iter = DictIter::new(dict.as_any());
            assert!(iter.next().unwrap().is_ok());
            dict.del_item(2).unwrap();
            dict.set_item(4, 4).unwrap();
            let err = iter.next().unwrap().unwrap_err();
            assert_eq!(err.to_string(), "dictionary keys changed during iteration");
        });
    }

    #[test]
    fn mutation_after_last_entry_is_still_reported() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            dict.set_item(1, 1).unwrap();
            let mut iter = DictIter::new(dict.as_any());
            assert!(iter.next().unwrap().is_ok());
            dict.del_item(1).unwrap();
            assert!(iter.next().unwrap().is_err());
        });
    }

    #[test]
    fn nested_iterators_over_the_same_dict() {
        Python::attach(|py| {
            let dict = PyDict::new(py);
            dict.set_item(1, 1).unwrap();
            dict.set_item(2, 2).unwrap();
            let mut outer = DictIter::new(dict.as_any());
            assert!(outer.next().unwrap().is_ok());
            {
                let inner = DictIter::new(dict.as_any());
                assert_eq!(inner.count(), 2);
            }
            dict.set_item(3, 3).unwrap();
            assert!(outer.next().unwrap().is_err());
        });
    }
}
