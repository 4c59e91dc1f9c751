//! graphcopy: identity-preserving deep and shallow copies of Python object graphs
//!
//! The traversal runs on raw CPython objects through PyO3. Per-call state lives in
//! a pooled native memo; the module-level objects it needs (copyreg hooks,
//! `copy.Error`, lazily loaded immutable types) are cached in `ModuleState`.

mod about;
mod config;
mod containers;
mod copy;
mod deepcopy;
mod dict_iter;
mod error;
mod extra;
mod fallback;
mod ffi;
mod keepalive;
mod memo;
mod memo_trait;
mod module_state;
mod proxy;
mod recursion;
mod reduce;
mod state;
mod types;
mod user_memo;

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};

/// Deep copy with optional memo
#[pyfunction]
#[pyo3(name = "deepcopy", signature = (x, memo=None))]
fn py_deepcopy<'py>(
    x: &Bound<'py, PyAny>,
    memo: Option<&Bound<'py, PyAny>>,
) -> PyResult<Bound<'py, PyAny>> {
    deepcopy::deepcopy_top(x, memo)
}

/// Shallow copy
#[pyfunction]
#[pyo3(name = "copy", signature = (x, /))]
fn py_copy<'py>(x: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>> {
    Ok(copy::copy(x)?)
}

/// Replace fields through `__replace__`
#[pyfunction]
#[pyo3(name = "replace", signature = (obj, /, **changes))]
fn py_replace<'py>(
    obj: &Bound<'py, PyAny>,
    changes: Option<&Bound<'py, PyDict>>,
) -> PyResult<Bound<'py, PyAny>> {
    copy::replace(obj, changes)
}

#[pymodule]
fn graphcopy(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    let state = module_state::get(py)?;

    m.add_function(wrap_pyfunction!(py_deepcopy, m)?)?;
    m.add_function(wrap_pyfunction!(py_copy, m)?)?;
    m.add_function(wrap_pyfunction!(py_replace, m)?)?;
    m.add_function(wrap_pyfunction!(extra::replicate, m)?)?;
    m.add_function(wrap_pyfunction!(extra::repeatcall, m)?)?;

    m.add_class::<proxy::MemoObject>()?;
    m.add_class::<proxy::KeepList>()?;
    m.add("Error", state.copy_error.bind(py))?;

    let extra = PyModule::new(py, "extra")?;
    extra.add_function(wrap_pyfunction!(extra::replicate, &extra)?)?;
    extra.add_function(wrap_pyfunction!(extra::repeatcall, &extra)?)?;
    m.add_submodule(&extra)?;

    m.add_submodule(&about::build(py)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;

    log::debug!("graphcopy {} initialized", env!("CARGO_PKG_VERSION"));
    Ok(())
}
