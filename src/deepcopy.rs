//! Core deepcopy implementation
//!
//! Flow per value:
//! 1. classify once; atomic immutables return before the memo is touched
//! 2. memo probe (shared structure and cycles)
//! 3. classes and opaque immutables return as-is
//! 4. everything else runs under the depth guard: a container handler, a
//!    `__deepcopy__` hook, or the reduce protocol
//!
//! The traversal is generic over `Memo`, so the native memo and the dict-protocol
//! memo each get their own monomorphized copy of it.

use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::{self, Config};
use crate::containers;
use crate::error::CloneResult;
use crate::memo_trait::{identity, Memo};
use crate::module_state::{self, ModuleState};
use crate::proxy::MemoObject;
use crate::recursion::DepthGuard;
use crate::reduce::{self, optional_attr, Deep};
use crate::state::{NativeMemo, PooledMemo};
use crate::types::{self, TypeClass};
use crate::user_memo::DictMemo;

/// Recursive step, shared by every handler.
#[inline]
pub fn deepcopy<'py, M: Memo<'py>>(
    obj: &Bound<'py, PyAny>,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let state = module_state::get(obj.py())?;
    let class = types::classify(obj, state);
    if class == TypeClass::AtomicImmutable {
        return Ok(obj.clone());
    }

    if let Some(found) = memo.lookup(identity(obj))? {
        return Ok(found);
    }

    let _guard = match class {
        TypeClass::ClassLike | TypeClass::OpaqueImmutable => return Ok(obj.clone()),
        _ => DepthGuard::enter()?,
    };

    match class {
        TypeClass::Sequence => containers::deepcopy_list(obj, memo),
        TypeClass::Tuple => containers::deepcopy_tuple(obj, memo),
        TypeClass::Mapping => containers::deepcopy_dict(obj, memo),
        TypeClass::Set => containers::deepcopy_set(obj, memo),
        TypeClass::FrozenSet => containers::deepcopy_frozenset(obj, memo),
        TypeClass::ByteBuffer => containers::deepcopy_bytearray(obj, memo),
        TypeClass::BoundCallable => containers::deepcopy_method(obj, memo),
        _ => deepcopy_object(obj, state, memo),
    }
}

/// Instances of user types: `__deepcopy__` if defined, else the reduce protocol.
#[cold]
fn deepcopy_object<'py, M: Memo<'py>>(
    obj: &Bound<'py, PyAny>,
    state: &ModuleState,
    memo: &mut M,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = obj.py();
    if let Some(hook) = optional_attr(obj, pyo3::intern!(py, "__deepcopy__"))? {
        let copy = memo.call_hook(&hook)?;
        if copy.as_ptr() != obj.as_ptr() {
            memo.insert(obj, &copy)?;
        }
        return Ok(copy);
    }
    reduce::reconstruct(obj, state, &mut Deep(memo))
}

/// `deepcopy(x, memo=None)`: picks the memo flavour, then runs the traversal.
pub fn deepcopy_top<'py>(
    x: &Bound<'py, PyAny>,
    memo: Option<&Bound<'py, PyAny>>,
) -> PyResult<Bound<'py, PyAny>> {
    deepcopy_top_with(x, memo, config::get())
}

pub(crate) fn deepcopy_top_with<'py>(
    x: &Bound<'py, PyAny>,
    memo: Option<&Bound<'py, PyAny>>,
    config: &Config,
) -> PyResult<Bound<'py, PyAny>> {
    let py = x.py();
    let state = module_state::get(py)?;

    match memo {
        None => {
            if types::is_atomic_immutable(x) {
                return Ok(x.clone());
            }
            if config.use_dict_memo {
                let mut memo = DictMemo::new(PyDict::new(py).into_any(), state);
                return Ok(deepcopy(x, &mut memo)?);
            }
            let mut memo = PooledMemo::checkout(py)?;
            Ok(deepcopy(x, &mut *memo)?)
        }
        Some(memo) if memo.is_none() => deepcopy_top_with(x, None, config),
        Some(memo) => match memo.extract::<Bound<'py, MemoObject>>() {
            Ok(native) => Ok(deepcopy(x, &mut NativeMemo::new(native))?),
            Err(_) => Ok(deepcopy(x, &mut DictMemo::new(memo.clone(), state))?),
        },
    }
}
