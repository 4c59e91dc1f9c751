//! Specialized handlers for container types - generic over Memo
//!
//! Every handler that registers its copy before descending forgets that entry
//! again if anything below it fails.

use pyo3::prelude::*;
use pyo3::sync::critical_section::with_critical_section;
use pyo3::types::{PyFrozenSet, PyTuple};

use crate::deepcopy::deepcopy;
use crate::dict_iter::DictIter;
use crate::error::{CloneError, CloneResult, MutationKind};
use crate::ffi;
use crate::memo_trait::{identity, Memo};

/// Run `fill` with `copy` already memoized for `source`; undo the entry on failure.
#[inline]
fn memoized<'py, M, F>(
    memo: &mut M,
    source: &Bound<'py, PyAny>,
    copy: Bound<'py, PyAny>,
    fill: F,
) -> CloneResult<Bound<'py, PyAny>>
where
    M: Memo<'py>,
    F: FnOnce(&mut M, &Bound<'py, PyAny>) -> CloneResult<()>,
{
    memo.insert(source, &copy)?;
    match fill(memo, &copy) {
        Ok(()) => Ok(copy),
        Err(err) => {
            memo.forget(identity(source));
            Err(err)
        }
    }
}

fn list_resized() -> CloneError {
    CloneError::MutationDuringIteration {
        container: "list",
        kind: MutationKind::SizeChanged,
    }
}

/// Deepcopy list with dynamic sizing - generic over Memo
pub fn deepcopy_list<'py, M: Memo<'py>>(
    list: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = list.py();
    let src = list.as_ptr();
    let size = with_critical_section(list, || unsafe { ffi::PyList_GET_SIZE(src) });

    // Placeholders keep the list valid while a hook can see it through the memo.
    let copy = unsafe { ffi::owned(py, ffi::PyList_New(size))? };
    for i in 0..size {
        unsafe {
            let none = ffi::Py_None();
            ffi::Py_INCREF(none);
            ffi::PyList_SET_ITEM(copy.as_ptr(), i, none);
        }
    }

    memoized(memo, list, copy, |memo, copy| {
        let dst = copy.as_ptr();
        for i in 0..size {
            let item = with_critical_section(list, || unsafe {
                (i < ffi::PyList_GET_SIZE(src)).then(|| ffi::borrowed(py, ffi::PyList_GET_ITEM(src, i)))
            })
            .ok_or_else(list_resized)?;
            let item_copy = deepcopy(&item, memo)?;
            if unsafe { ffi::PyList_GET_SIZE(dst) } != size {
                return Err(list_resized());
            }
            // Steals the new reference and releases the placeholder.
            ffi::check(py, unsafe {
                ffi::PyList_SetItem(dst, i, item_copy.into_ptr())
            })?;
        }

        // Elements appended by hooks during the first pass.
        let mut i = size;
        while let Some(item) = with_critical_section(list, || unsafe {
            (i < ffi::PyList_GET_SIZE(src)).then(|| ffi::borrowed(py, ffi::PyList_GET_ITEM(src, i)))
        }) {
            let item_copy = deepcopy(&item, memo)?;
            ffi::check(py, unsafe { ffi::PyList_Append(dst, item_copy.as_ptr()) })?;
            i += 1;
        }
        Ok(())
    })
}

/// Deepcopy tuple with immutability optimization - generic over Memo
pub fn deepcopy_tuple<'py, M: Memo<'py>>(
    tuple: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = tuple.py();
    let src = tuple.as_ptr();
    let size = unsafe { ffi::PyTuple_GET_SIZE(src) };

    let mut staged = Vec::with_capacity(size as usize);
    let mut all_identical = true;
    for i in 0..size {
        let item = unsafe { ffi::borrowed(py, ffi::PyTuple_GET_ITEM(src, i)) };
        let item_copy = deepcopy(&item, memo)?;
        all_identical &= item_copy.as_ptr() == item.as_ptr();
        staged.push(item_copy);
    }

    if all_identical {
        return Ok(tuple.clone());
    }

    // A self-referential tuple may have been copied while copying its elements.
    if let Some(existing) = memo.lookup(identity(tuple))? {
        return Ok(existing);
    }

    let copy = PyTuple::new(py, staged)?.into_any();
    memo.insert(tuple, &copy)?;
    Ok(copy)
}

/// Deepcopy dict with mutation detection - generic over Memo
pub fn deepcopy_dict<'py, M: Memo<'py>>(
    dict: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = dict.py();
    let copy = unsafe {
        ffi::owned(py, ffi::_PyDict_NewPresized(ffi::PyDict_Size(dict.as_ptr())))?
    };

    memoized(memo, dict, copy, |memo, copy| {
        for entry in DictIter::new(dict) {
            let (key, value) = entry?;
            let key_copy = deepcopy(&key, memo)?;
            let value_copy = deepcopy(&value, memo)?;
            ffi::check(py, unsafe {
                ffi::PyDict_SetItem(copy.as_ptr(), key_copy.as_ptr(), value_copy.as_ptr())
            })?;
        }
        Ok(())
    })
}

/// Consistent view of a set's members, taken under the set's critical section.
fn snapshot<'py>(set: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>> {
    with_critical_section(set, || unsafe {
        ffi::owned(set.py(), ffi::PySequence_Tuple(set.as_ptr()))
    })
}

/// Iterate a snapshot tuple, yielding owned items.
fn members<'a, 'py>(
    snapshot: &'a Bound<'py, PyAny>,
) -> impl Iterator<Item = Bound<'py, PyAny>> + 'a {
    let ptr = snapshot.as_ptr();
    let size = unsafe { ffi::PyTuple_GET_SIZE(ptr) };
    (0..size).map(move |i| unsafe { ffi::borrowed(snapshot.py(), ffi::PyTuple_GET_ITEM(ptr, i)) })
}

/// Deepcopy set with snapshot - generic over Memo
pub fn deepcopy_set<'py, M: Memo<'py>>(
    set: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = set.py();
    let copy = unsafe { ffi::owned(py, ffi::PySet_New(std::ptr::null_mut()))? };

    memoized(memo, set, copy, |memo, copy| {
        let items = snapshot(set)?;
        for item in members(&items) {
            let item_copy = deepcopy(&item, memo)?;
            ffi::check(py, unsafe { ffi::PySet_Add(copy.as_ptr(), item_copy.as_ptr()) })?;
        }
        Ok(())
    })
}

/// Deepcopy frozenset - generic over Memo
pub fn deepcopy_frozenset<'py, M: Memo<'py>>(
    fset: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = fset.py();
    let items = snapshot(fset)?;
    let copies = members(&items)
        .map(|item| deepcopy(&item, memo))
        .collect::<CloneResult<Vec<_>>>()?;

    if let Some(existing) = memo.lookup(identity(fset))? {
        return Ok(existing);
    }
    let copy = PyFrozenSet::new(py, copies)?.into_any();
    memo.insert(fset, &copy)?;
    Ok(copy)
}

/// Deepcopy bytearray - generic over Memo
pub fn deepcopy_bytearray<'py, M: Memo<'py>>(
    buffer: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = buffer.py();
    let copy = unsafe {
        let src = buffer.as_ptr();
        ffi::owned(
            py,
            ffi::PyByteArray_FromStringAndSize(ffi::PyByteArray_AsString(src), ffi::PyByteArray_Size(src)),
        )?
    };
    memo.insert(buffer, &copy)?;
    Ok(copy)
}

/// Deepcopy bound method: same function, copied receiver
pub fn deepcopy_method<'py, M: Memo<'py>>(
    method: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = method.py();
    let func = method.getattr(pyo3::intern!(py, "__func__"))?;
    let receiver = method.getattr(pyo3::intern!(py, "__self__"))?;
    let receiver_copy = deepcopy(&receiver, memo)?;
    let copy = unsafe { ffi::owned(py, ffi::PyMethod_New(func.as_ptr(), receiver_copy.as_ptr()))? };
    memo.insert(method, &copy)?;
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::MemoObject;
    use crate::state::NativeMemo;
    use pyo3::exceptions::PyRuntimeError;
    use pyo3::types::PyDict;

    fn native(py: Python<'_>) -> NativeMemo<'_> {
        NativeMemo::new(Bound::new(py, MemoObject::default()).unwrap())
    }

    fn eval<'py>(py: Python<'py>, setup: &std::ffi::CStr, expr: &std::ffi::CStr) -> Bound<'py, PyAny> {
        let globals = PyDict::new(py);
        py.run(setup, Some(&globals), None).unwrap();
        py.eval(expr, Some(&globals), None).unwrap()
    }

    #[test]
    fn self_referential_list() {
        Python::attach(|py| {
            let list = eval(py, c"x = [1, 2]\nx.append(x)", c"x");
            let mut memo = native(py);
            let copy = deepcopy_list(&list, &mut memo).unwrap();
            assert_ne!(copy.as_ptr(), list.as_ptr());
            assert_eq!(copy.get_item(2).unwrap().as_ptr(), copy.as_ptr());
            assert_eq!(copy.get_item(0).unwrap().extract::<i64>().unwrap(), 1);
        });
    }

    #[test]
    fn list_growth_during_copy_is_appended() {
        Python::attach(|py| {
            let list = eval(
                py,
                c"
class Grow:
    def __init__(self, target):
        self.target = target
    def __deepcopy__(self, memo):
        self.target.append(99)
        return 'grown'
x = []
x.append(Grow(x))
",
                c"x",
            );
            let mut memo = native(py);
            let copy = deepcopy_list(&list, &mut memo).unwrap();
            let items: Vec<Bound<'_, PyAny>> = copy.try_iter().unwrap().map(|i| i.unwrap()).collect();
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].extract::<String>().unwrap(), "grown");
            assert_eq!(items[1].extract::<i64>().unwrap(), 99);
        });
    }

    #[test]
    fn list_shrink_during_copy_fails_and_forgets() {
        Python::attach(|py| {
            let list = eval(
                py,
                c"
class Shrink:
    def __init__(self, target):
        self.target = target
    def __deepcopy__(self, memo):
        self.target.clear()
        return None
x = []
x.append(Shrink(x))
x.append(1)
",
                c"x",
            );
            let mut memo = native(py);
            let err = deepcopy_list(&list, &mut memo).unwrap_err();
            assert_eq!(err.to_string(), "list changed size during iteration");
            assert!(memo.lookup(identity(&list)).unwrap().is_none());
        });
    }

    #[test]
    fn immutable_tuple_is_returned_as_is() {
        Python::attach(|py| {
            let tuple = eval(py, c"x = (1, 'a', (None, 2.5))", c"x");
            let mut memo = native(py);
            let copy = deepcopy_tuple(&tuple, &mut memo).unwrap();
            assert_eq!(copy.as_ptr(), tuple.as_ptr());
        });
    }

    #[test]
    fn tuple_with_mutable_member_is_copied() {
        Python::attach(|py| {
            let tuple = eval(py, c"x = ([1, 2],)", c"x");
            let mut memo = native(py);
            let copy = deepcopy_tuple(&tuple, &mut memo).unwrap();
            assert_ne!(copy.as_ptr(), tuple.as_ptr());
            let inner = copy.get_item(0).unwrap();
            assert_ne!(inner.as_ptr(), tuple.get_item(0).unwrap().as_ptr());
            assert!(inner.eq(tuple.get_item(0).unwrap()).unwrap());
        });
    }

    #[test]
    fn self_referential_tuple_has_one_copy() {
        Python::attach(|py| {
            let tuple = eval(py, c"l = []\nx = (l,)\nl.append(x)", c"x");
            let mut memo = native(py);
            let copy = deepcopy_tuple(&tuple, &mut memo).unwrap();
            let inner_list = copy.get_item(0).unwrap();
            assert_eq!(inner_list.get_item(0).unwrap().as_ptr(), copy.as_ptr());
        });
    }

    #[test]
    fn dict_copy_is_independent() {
        Python::attach(|py| {
            let dict = eval(py, c"x = {'a': [1], 'b': {'c': 2}}", c"x");
            let mut memo = native(py);
            let copy = deepcopy_dict(&dict, &mut memo).unwrap();
            copy.get_item("a").unwrap().call_method1("append", (2,)).unwrap();
            assert_eq!(dict.get_item("a").unwrap().len().unwrap(), 1);
            assert!(copy.get_item("b").unwrap().eq(dict.get_item("b").unwrap()).unwrap());
        });
    }

    #[test]
    fn large_dict_copies_every_entry_in_order() {
        Python::attach(|py| {
            let dict = eval(py, c"x = {i: [i] for i in range(5000)}", c"x");
            let mut memo = native(py);
            let copy = deepcopy_dict(&dict, &mut memo).unwrap();
            assert!(copy.is_exact_instance_of::<PyDict>());
            assert!(copy.eq(&dict).unwrap());
            let keys = copy.call_method0("keys").unwrap().call_method0("__iter__").unwrap();
            let first = keys.call_method0("__next__").unwrap();
            assert_eq!(first.extract::<i64>().unwrap(), 0);
            assert_ne!(
                copy.get_item(4999).unwrap().as_ptr(),
                dict.get_item(4999).unwrap().as_ptr()
            );
        });
    }

    #[test]
    fn dict_mutated_by_hook_raises_and_is_forgotten() {
        Python::attach(|py| {
            let dict = eval(
                py,
                c"
class Meddle:
    def __init__(self, target):
        self.target = target
    def __deepcopy__(self, memo):
        self.target['extra'] = 1
        return self
x = {}
x['m'] = Meddle(x)
x['n'] = 0
",
                c"x",
            );
            let mut memo = native(py);
            let err = deepcopy_dict(&dict, &mut memo).unwrap_err();
            assert_eq!(err.to_string(), "dictionary changed size during iteration");
            let err: PyErr = err.into();
            assert!(err.is_instance_of::<PyRuntimeError>(py));
            assert!(memo.lookup(identity(&dict)).unwrap().is_none());
        });
    }

    #[test]
    fn sets_and_frozensets() {
        Python::attach(|py| {
            let set = eval(py, c"x = {1, 'two', (3,)}", c"x");
            let mut memo = native(py);
            let copy = deepcopy_set(&set, &mut memo).unwrap();
            assert_ne!(copy.as_ptr(), set.as_ptr());
            assert!(copy.eq(&set).unwrap());

            let fset = eval(py, c"x = frozenset({1, 2})", c"x");
            let copy = deepcopy_frozenset(&fset, &mut memo).unwrap();
            assert!(copy.eq(&fset).unwrap());
            assert_eq!(
                memo.lookup(identity(&fset)).unwrap().unwrap().as_ptr(),
                copy.as_ptr()
            );
        });
    }

    #[test]
    fn bytearray_and_bound_method() {
        Python::attach(|py| {
            let buffer = eval(py, c"x = bytearray(b'abc')", c"x");
            let mut memo = native(py);
            let copy = deepcopy_bytearray(&buffer, &mut memo).unwrap();
            assert_ne!(copy.as_ptr(), buffer.as_ptr());
            assert!(copy.eq(&buffer).unwrap());

            let method = eval(py, c"class C:\n    def m(self): return self\nx = C().m", c"x");
            let copy = deepcopy_method(&method, &mut memo).unwrap();
            let receiver = method.getattr("__self__").unwrap();
            let copied_receiver = copy.getattr("__self__").unwrap();
            assert_ne!(receiver.as_ptr(), copied_receiver.as_ptr());
            assert_eq!(
                copy.getattr("__func__").unwrap().as_ptr(),
                method.getattr("__func__").unwrap().as_ptr()
            );
        });
    }
}
