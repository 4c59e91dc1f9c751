//! Extra utilities: replicate and repeatcall

use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyList;

use crate::deepcopy::deepcopy_top;
use crate::module_state;
use crate::types;

const DEFAULT_COMPILE_AFTER: isize = 20;

fn call_repeatedly<'py>(function: &Bound<'py, PyAny>, size: usize) -> PyResult<Bound<'py, PyList>> {
    let items = (0..size)
        .map(|_| function.call0())
        .collect::<PyResult<Vec<_>>>()?;
    PyList::new(function.py(), items)
}

/// `n` independent deep copies of `obj`.
///
/// Large batches go through a precompiled reconstructor when one is installed;
/// otherwise every copy is a regular `deepcopy` with a pooled memo.
#[pyfunction]
#[pyo3(signature = (obj, n, /, *, compile_after=None))]
pub fn replicate<'py>(
    obj: &Bound<'py, PyAny>,
    n: isize,
    compile_after: Option<isize>,
) -> PyResult<Bound<'py, PyList>> {
    let py = obj.py();
    let state = module_state::get(py)?;

    if n < 0 {
        return Err(PyValueError::new_err("n must be >= 0"));
    }
    if compile_after.is_some() && state.precompiler.is_none() {
        return Err(PyTypeError::new_err(
            "replicate(): 'compile_after' requires duper.snapshots; it is not available",
        ));
    }
    let compile_after = compile_after.unwrap_or(DEFAULT_COMPILE_AFTER);
    if compile_after < 0 {
        return Err(PyValueError::new_err("compile_after must be >= 0"));
    }

    let n = n as usize;
    if n == 0 {
        return Ok(PyList::empty(py));
    }
    if types::is_atomic_immutable(obj) {
        return PyList::new(py, vec![obj; n]);
    }

    match &state.precompiler {
        Some(precompiler) if n > compile_after as usize => {
            let precompiler = precompiler.bind(py);
            if !precompiler.is_callable() {
                return Err(PyRuntimeError::new_err(
                    "duper.snapshots.create_precompiler_reconstructor is not callable",
                ));
            }
            let factory = precompiler.call1((obj,))?;
            if !factory.is_callable() {
                return Err(PyTypeError::new_err("reconstructor must be callable (FunctionType)"));
            }
            log::debug!("replicate: {n} copies through a precompiled reconstructor");
            call_repeatedly(&factory, n)
        }
        _ => {
            let copies = (0..n)
                .map(|_| deepcopy_top(obj, None))
                .collect::<PyResult<Vec<_>>>()?;
            PyList::new(py, copies)
        }
    }
}

/// `[function() for _ in range(size)]`
#[pyfunction]
#[pyo3(signature = (function, size, /))]
pub fn repeatcall<'py>(function: &Bound<'py, PyAny>, size: isize) -> PyResult<Bound<'py, PyList>> {
    if !function.is_callable() {
        return Err(PyTypeError::new_err("function must be callable"));
    }
    if size < 0 {
        return Err(PyValueError::new_err("size must be >= 0"));
    }
    call_repeatedly(function, size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyDict;

    #[test]
    fn replicas_are_independent() {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            py.run(c"obj = {'items': [1, 2], 'nested': {'k': [3]}}", Some(&globals), None)
                .unwrap();
            let obj = globals.get_item("obj").unwrap().unwrap();
            let copies = replicate(&obj, 5, None).unwrap();
            assert_eq!(copies.len(), 5);

            let first = copies.get_item(0).unwrap();
            first.get_item("items").unwrap().call_method1("append", (9,)).unwrap();
            for copy in copies.iter().skip(1) {
                assert_ne!(copy.as_ptr(), obj.as_ptr());
                assert!(copy.eq(&obj).unwrap());
            }
            assert_eq!(obj.get_item("items").unwrap().len().unwrap(), 2);
        });
    }

    #[test]
    fn replicate_edge_cases() {
        Python::attach(|py| {
            let obj = PyList::empty(py).into_any();
            assert_eq!(replicate(&obj, 0, None).unwrap().len(), 0);
            let err = replicate(&obj, -1, None).unwrap_err();
            assert!(err.is_instance_of::<PyValueError>(py));

            let atom = 7i64.into_pyobject(py).unwrap().into_any();
            let copies = replicate(&atom, 3, None).unwrap();
            assert!(copies.iter().all(|c| c.as_ptr() == atom.as_ptr()));
        });
    }

    #[test]
    fn compile_after_needs_the_precompiler() {
        Python::attach(|py| {
            let state = module_state::get(py).unwrap();
            let obj = PyList::empty(py).into_any();
            let result = replicate(&obj, 2, Some(1));
            if state.precompiler.is_none() {
                assert!(result.unwrap_err().is_instance_of::<PyTypeError>(py));
            } else {
                assert_eq!(result.unwrap().len(), 2);
            }
        });
    }

    #[test]
    fn repeatcall_collects_results() {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            py.run(c"import itertools\ncounter = itertools.count()\nf = lambda: next(counter)", Some(&globals), None)
                .unwrap();
            let f = globals.get_item("f").unwrap().unwrap();
            let values: Vec<i64> = repeatcall(&f, 4).unwrap().extract().unwrap();
            assert_eq!(values, vec![0, 1, 2, 3]);

            assert!(repeatcall(&f, -1).unwrap_err().is_instance_of::<PyValueError>(py));
            let not_callable = 1i64.into_pyobject(py).unwrap().into_any();
            assert!(repeatcall(&not_callable, 1).unwrap_err().is_instance_of::<PyTypeError>(py));
        });
    }
}
