//! Engine error taxonomy and its mapping onto Python exceptions

use std::collections::TryReserveError;
use std::fmt;

use pyo3::exceptions::{PyMemoryError, PyRecursionError, PyRuntimeError, PyTypeError};
use pyo3::prelude::*;
use thiserror::Error;

use crate::module_state;

/// Which structural change was observed while iterating a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    SizeChanged,
    KeysChanged,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::SizeChanged => f.write_str("changed size during iteration"),
            MutationKind::KeysChanged => f.write_str("keys changed during iteration"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CloneError {
    /// A `__reduce__`-style descriptor had the wrong arity or element kinds.
    #[error("{0}")]
    MalformedDescriptor(String),

    #[error("{container} {kind}")]
    MutationDuringIteration {
        container: &'static str,
        kind: MutationKind,
    },

    #[error("Stack overflow (depth {depth}) while deep copying an object")]
    RecursionExceeded { depth: u32 },

    /// Nothing usable describes how to rebuild the value.
    #[error("{0}")]
    UnsupportedValue(String),

    #[error("memo allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    /// Raised by user code (hooks, constructors, setters); propagated verbatim.
    #[error(transparent)]
    Python(#[from] PyErr),
}

impl CloneError {
    pub fn dict_mutated(kind: MutationKind) -> Self {
        CloneError::MutationDuringIteration {
            container: "dictionary",
            kind,
        }
    }
}

impl From<CloneError> for PyErr {
    fn from(err: CloneError) -> PyErr {
        match err {
            CloneError::Python(err) => err,
            CloneError::MalformedDescriptor(msg) => PyTypeError::new_err(msg),
            err @ CloneError::MutationDuringIteration { .. } => {
                PyRuntimeError::new_err(err.to_string())
            }
            err @ CloneError::RecursionExceeded { .. } => {
                PyRecursionError::new_err(err.to_string())
            }
            err @ CloneError::Allocation(_) => PyMemoryError::new_err(err.to_string()),
            CloneError::UnsupportedValue(msg) => Python::attach(|py| {
                match module_state::get(py) {
                    Ok(state) => PyErr::from_type(state.copy_error.bind(py).clone(), msg),
                    Err(err) => err,
                }
            }),
        }
    }
}

pub type CloneResult<T> = Result<T, CloneError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::exceptions::PyValueError;

    #[test]
    fn messages_match_python_wording() {
        assert_eq!(
            CloneError::dict_mutated(MutationKind::SizeChanged).to_string(),
            "dictionary changed size during iteration"
        );
        assert_eq!(
            CloneError::dict_mutated(MutationKind::KeysChanged).to_string(),
            "dictionary keys changed during iteration"
        );
        assert_eq!(
            CloneError::RecursionExceeded { depth: 42 }.to_string(),
            "Stack overflow (depth 42) while deep copying an object"
        );
    }

    #[test]
    fn maps_onto_python_exception_types() {
        Python::attach(|py| {
            let err: PyErr = CloneError::MalformedDescriptor("bad".into()).into();
            assert!(err.is_instance_of::<PyTypeError>(py));

            let err: PyErr = CloneError::dict_mutated(MutationKind::KeysChanged).into();
            assert!(err.is_instance_of::<PyRuntimeError>(py));

            let err: PyErr = CloneError::RecursionExceeded { depth: 1 }.into();
            assert!(err.is_instance_of::<PyRecursionError>(py));

            let err: PyErr = CloneError::UnsupportedValue("nope".into()).into();
            let copy_error = py.import("copy").unwrap().getattr("Error").unwrap();
            assert_eq!(err.get_type(py).as_ptr(), copy_error.as_ptr());

            let original = PyValueError::new_err("hook failed");
            let err: PyErr = CloneError::from(original).into();
            assert!(err.is_instance_of::<PyValueError>(py));
        });
    }
}
