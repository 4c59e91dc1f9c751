//! Shallow copy and `replace`

use std::ptr::addr_of_mut;

use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::error::CloneResult;
use crate::ffi;
use crate::module_state;
use crate::reduce::{self, optional_attr, Shallow};
use crate::types;

/// Fresh empty instance for an exact builtin container that is empty.
fn empty_like<'py>(obj: &Bound<'py, PyAny>) -> PyResult<Option<Bound<'py, PyAny>>> {
    let ptr = obj.as_ptr();
    let tp = ffi::type_of(obj);
    unsafe {
        let fresh = if tp == addr_of_mut!(ffi::PyList_Type) && ffi::PyList_GET_SIZE(ptr) == 0 {
            ffi::PyList_New(0)
        } else if tp == addr_of_mut!(ffi::PyDict_Type) && ffi::PyDict_Size(ptr) == 0 {
            ffi::PyDict_New()
        } else if tp == addr_of_mut!(ffi::PySet_Type) && ffi::PySet_Size(ptr) == 0 {
            ffi::PySet_New(std::ptr::null_mut())
        } else if tp == addr_of_mut!(ffi::PyByteArray_Type) && ffi::PyByteArray_Size(ptr) == 0 {
            ffi::PyByteArray_FromStringAndSize(std::ptr::null(), 0)
        } else {
            return Ok(None);
        };
        ffi::owned(obj.py(), fresh).map(Some)
    }
}

/// `copy(x)`: one level only.
pub fn copy<'py>(obj: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>> {
    let py = obj.py();
    let state = module_state::get(py)?;

    if types::is_shallow_immutable(obj, state) {
        return Ok(obj.clone());
    }
    if let Some(fresh) = empty_like(obj)? {
        return Ok(fresh);
    }
    if types::is_copyable_builtin_container(obj) {
        return Ok(obj.call_method0(pyo3::intern!(py, "copy"))?);
    }

    if let Some(hook) = optional_attr(obj, pyo3::intern!(py, "__copy__"))? {
        return Ok(hook.call0()?);
    }
    reduce::reconstruct(obj, state, &mut Shallow)
}

/// `replace(obj, /, **changes)` through `type(obj).__replace__`.
pub fn replace<'py>(
    obj: &Bound<'py, PyAny>,
    changes: Option<&Bound<'py, PyDict>>,
) -> PyResult<Bound<'py, PyAny>> {
    let py = obj.py();
    let tp = obj.get_type();
    let Some(hook) = optional_attr(tp.as_any(), pyo3::intern!(py, "__replace__"))? else {
        return Err(PyTypeError::new_err(format!(
            "replace() does not support {} objects",
            tp.name()?
        )));
    };
    hook.call((obj,), changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval<'py>(py: Python<'py>, setup: &std::ffi::CStr, expr: &std::ffi::CStr) -> Bound<'py, PyAny> {
        let globals = PyDict::new(py);
        py.run(setup, Some(&globals), None).unwrap();
        py.eval(expr, Some(&globals), None).unwrap()
    }

    #[test]
    fn immutables_come_back_unchanged() {
        Python::attach(|py| {
            for expr in [c"(1, [2])", c"frozenset({1})", c"slice(1, 2)", c"int", c"'s'", c"range(2)"] {
                let obj = eval(py, c"", expr);
                assert_eq!(copy(&obj).unwrap().as_ptr(), obj.as_ptr(), "{expr:?}");
            }
        });
    }

    #[test]
    fn builtin_containers_are_copied_one_level() {
        Python::attach(|py| {
            for expr in [c"[[1], 2]", c"{'a': [1]}", c"{1, 2}", c"bytearray(b'xy')", c"[]", c"{}"] {
                let obj = eval(py, c"", expr);
                let copied = copy(&obj).unwrap();
                assert_ne!(copied.as_ptr(), obj.as_ptr(), "{expr:?}");
                assert!(copied.eq(&obj).unwrap(), "{expr:?}");
            }
            let obj = eval(py, c"", c"[[1]]");
            let copied = copy(&obj).unwrap();
            assert_eq!(copied.get_item(0).unwrap().as_ptr(), obj.get_item(0).unwrap().as_ptr());
        });
    }

    #[test]
    fn copy_hook_and_reduce_fallback() {
        Python::attach(|py| {
            let setup = c"
class Hooked:
    def __copy__(self):
        return 'hooked'

class Plain:
    def __init__(self):
        self.items = [1]
";
            let hooked = eval(py, setup, c"Hooked()");
            assert_eq!(copy(&hooked).unwrap().extract::<String>().unwrap(), "hooked");

            let plain = eval(py, setup, c"Plain()");
            let copied = copy(&plain).unwrap();
            assert_ne!(copied.as_ptr(), plain.as_ptr());
            assert_eq!(
                copied.getattr("items").unwrap().as_ptr(),
                plain.getattr("items").unwrap().as_ptr()
            );
        });
    }

    #[test]
    fn replace_uses_type_hook() {
        Python::attach(|py| {
            let setup = c"
class Point:
    def __init__(self, x, y):
        self.x, self.y = x, y
    def __replace__(self, **changes):
        return Point(changes.get('x', self.x), changes.get('y', self.y))
";
            let point = eval(py, setup, c"Point(1, 2)");
            let changes = PyDict::new(py);
            changes.set_item("y", 5).unwrap();
            let replaced = replace(&point, Some(&changes)).unwrap();
            assert_eq!(replaced.getattr("x").unwrap().extract::<i64>().unwrap(), 1);
            assert_eq!(replaced.getattr("y").unwrap().extract::<i64>().unwrap(), 5);

            let err = replace(&eval(py, c"", c"[1]"), None).unwrap_err();
            assert!(err.is_instance_of::<PyTypeError>(py));
            assert_eq!(
                err.value(py).to_string(),
                "replace() does not support list objects"
            );
        });
    }
}
