//! Interpreter objects the engine consults on every call
//! - Imported once, then shared by all threads for the life of the process
//! - Optional pieces (re, decimal, fractions, precompiler) degrade to `None`

use std::sync::OnceLock;

use pyo3::prelude::*;
use pyo3::types::PyType;

pub struct ModuleState {
    /// `copyreg.dispatch_table`
    pub dispatch_table: Py<PyAny>,
    pub newobj: Py<PyAny>,
    pub newobj_ex: Py<PyAny>,
    /// `copy.Error`
    pub copy_error: Py<PyType>,
    pub weakref_type: Py<PyAny>,
    pub re_pattern: Option<Py<PyAny>>,
    pub decimal: Option<Py<PyAny>>,
    pub fraction: Option<Py<PyAny>>,
    /// `duper.snapshots.create_precompiler_reconstructor`, when installed.
    pub precompiler: Option<Py<PyAny>>,
    /// Private `object()` used as the "missing" default for `mapping.get`.
    pub sentinel: Py<PyAny>,
}

static STATE: OnceLock<ModuleState> = OnceLock::new();

/// Shared state, loading it on first use.
#[inline]
pub fn get(py: Python<'_>) -> PyResult<&'static ModuleState> {
    if let Some(state) = STATE.get() {
        return Ok(state);
    }
    let loaded = ModuleState::load(py)?;
    Ok(STATE.get_or_init(|| loaded))
}

fn optional_attr(py: Python<'_>, module: &str, attr: &str) -> Option<Py<PyAny>> {
    match py.import(module).and_then(|m| m.getattr(attr)) {
        Ok(value) => Some(value.unbind()),
        Err(err) => {
            log::debug!("{module}.{attr} unavailable: {err}");
            None
        }
    }
}

impl ModuleState {
    fn load(py: Python<'_>) -> PyResult<Self> {
        let copyreg = py.import("copyreg")?;
        let copy = py.import("copy")?;
        let weakref = py.import("weakref")?;

        let precompiler = optional_attr(py, "duper.snapshots", "create_precompiler_reconstructor");
        if precompiler.is_some() {
            log::debug!("precompiled reconstructors available for replicate()");
        }

        Ok(Self {
            dispatch_table: copyreg.getattr("dispatch_table")?.unbind(),
            newobj: copyreg.getattr("__newobj__")?.unbind(),
            newobj_ex: copyreg.getattr("__newobj_ex__")?.unbind(),
            copy_error: copy.getattr("Error")?.extract::<Bound<'_, PyType>>()?.unbind(),
            weakref_type: weakref.getattr("ref")?.unbind(),
            re_pattern: optional_attr(py, "re", "Pattern"),
            decimal: optional_attr(py, "decimal", "Decimal"),
            fraction: optional_attr(py, "fractions", "Fraction"),
            precompiler,
            sentinel: py.import("builtins")?.getattr("object")?.call0()?.unbind(),
        })
    }

    /// Is `tp` one of the stdlib value types that are immutable but opaque to the
    /// type classifier (loaded at runtime rather than linked)?
    #[inline]
    pub fn is_runtime_immutable_type(&self, tp: *mut pyo3::ffi::PyObject) -> bool {
        tp == self.weakref_type.as_ptr()
            || [&self.re_pattern, &self.decimal, &self.fraction]
                .into_iter()
                .flatten()
                .any(|known| known.as_ptr() == tp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_stdlib_collaborators() {
        Python::attach(|py| {
            let state = get(py).unwrap();
            let copyreg = py.import("copyreg").unwrap();
            let newobj = copyreg.getattr("__newobj__").unwrap();
            assert_eq!(state.newobj.as_ptr(), newobj.as_ptr());
            assert!(state.re_pattern.is_some());

            // Second call hands back the same instance.
            let again = get(py).unwrap();
            assert!(std::ptr::eq(state, again));
        });
    }

    #[test]
    fn recognizes_runtime_immutable_types() {
        Python::attach(|py| {
            let state = get(py).unwrap();
            let pattern = py
                .import("re")
                .unwrap()
                .call_method1("compile", ("a+",))
                .unwrap();
            assert!(state.is_runtime_immutable_type(pattern.get_type().as_ptr()));

            let list = pyo3::types::PyList::empty(py);
            assert!(!state.is_runtime_immutable_type(list.get_type().as_ptr()));
        });
    }
}
