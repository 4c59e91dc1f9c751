//! Reduce protocol handling for generic object copies
//!
//! `copyreg.dispatch_table` first, then `__reduce_ex__(4)`, then `__reduce__()`.
//! The descriptor is validated up front; the rebuilt instance is registered
//! before its state is applied so state that points back at the instance resolves.

use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyTuple;

use crate::deepcopy::deepcopy;
use crate::dict_iter::DictIter;
use crate::error::{CloneError, CloneResult};
use crate::ffi;
use crate::memo_trait::{identity, Memo};
use crate::module_state::ModuleState;

/// How descriptor parts are turned into the parts of the copy.
pub trait Rebuild<'py> {
    /// Copy of one argument, state or item value.
    fn child(&mut self, value: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>>;

    /// The instance exists; children may now refer back to it.
    fn record(&mut self, source: &Bound<'py, PyAny>, instance: &Bound<'py, PyAny>) -> CloneResult<()>;

    fn rollback(&mut self, source: &Bound<'py, PyAny>);
}

/// Recursive copy through a memo.
pub struct Deep<'m, M>(pub &'m mut M);

impl<'py, M: Memo<'py>> Rebuild<'py> for Deep<'_, M> {
    #[inline]
    fn child(&mut self, value: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>> {
        deepcopy(value, self.0)
    }

    #[inline]
    fn record(&mut self, source: &Bound<'py, PyAny>, instance: &Bound<'py, PyAny>) -> CloneResult<()> {
        self.0.insert(source, instance)
    }

    #[inline]
    fn rollback(&mut self, source: &Bound<'py, PyAny>) {
        self.0.forget(identity(source));
    }
}

/// One level only: parts are reused as they are.
pub struct Shallow;

impl<'py> Rebuild<'py> for Shallow {
    #[inline]
    fn child(&mut self, value: &Bound<'py, PyAny>) -> CloneResult<Bound<'py, PyAny>> {
        Ok(value.clone())
    }

    #[inline]
    fn record(&mut self, _source: &Bound<'py, PyAny>, _instance: &Bound<'py, PyAny>) -> CloneResult<()> {
        Ok(())
    }

    #[inline]
    fn rollback(&mut self, _source: &Bound<'py, PyAny>) {}
}

/// Validated `(callable, args, state?, listitems?, dictitems?)`.
struct Descriptor<'py> {
    callable: Bound<'py, PyAny>,
    args: Bound<'py, PyTuple>,
    state: Option<Bound<'py, PyAny>>,
    listitems: Option<Bound<'py, PyAny>>,
    dictitems: Option<Bound<'py, PyAny>>,
}

enum Reduced<'py> {
    /// A str/bytes result: the object names a global and is copied by reference.
    ByReference,
    Rebuild(Descriptor<'py>),
}

fn type_name(obj: &Bound<'_, PyAny>) -> String {
    obj.get_type()
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "?".to_owned())
}

/// `getattr` that treats a missing attribute as `None`.
pub(crate) fn optional_attr<'py>(
    obj: &Bound<'py, PyAny>,
    name: &Bound<'py, pyo3::types::PyString>,
) -> PyResult<Option<Bound<'py, PyAny>>> {
    match obj.getattr(name) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_instance_of::<pyo3::exceptions::PyAttributeError>(obj.py()) => Ok(None),
        Err(err) => Err(err),
    }
}

fn call_reducer<'py>(obj: &Bound<'py, PyAny>, state: &ModuleState) -> CloneResult<Bound<'py, PyAny>> {
    let py = obj.py();
    let tp = obj.get_type();

    let registered = unsafe {
        ffi::PyDict_GetItemWithError(state.dispatch_table.as_ptr(), tp.as_ptr())
    };
    if !registered.is_null() {
        let reducer = unsafe { ffi::borrowed(py, registered) };
        if !reducer.is_callable() {
            return Err(PyTypeError::new_err("copyreg.dispatch_table value is not callable").into());
        }
        return Ok(reducer.call1((obj,))?);
    }
    if let Some(err) = PyErr::take(py) {
        return Err(err.into());
    }

    if let Some(reduce_ex) = optional_attr(obj, pyo3::intern!(py, "__reduce_ex__"))? {
        return Ok(reduce_ex.call1((4,))?);
    }
    if let Some(reduce) = optional_attr(obj, pyo3::intern!(py, "__reduce__"))? {
        return Ok(reduce.call0()?);
    }
    Err(CloneError::UnsupportedValue(format!(
        "un(deep)copyable object of type {}",
        type_name(obj)
    )))
}

fn none_to_option(value: Bound<'_, PyAny>) -> Option<Bound<'_, PyAny>> {
    (!value.is_none()).then_some(value)
}

fn validate<'py>(reduced: Bound<'py, PyAny>) -> CloneResult<Reduced<'py>> {
    let ptr = reduced.as_ptr();
    if unsafe { ffi::PyUnicode_Check(ptr) != 0 || ffi::PyBytes_Check(ptr) != 0 } {
        return Ok(Reduced::ByReference);
    }
    let Ok(parts) = reduced.extract::<Bound<'py, PyTuple>>() else {
        return Err(CloneError::MalformedDescriptor(
            "__reduce__ must return a tuple or str".to_owned(),
        ));
    };
    let size = parts.len();
    if !(2..=5).contains(&size) {
        return Err(CloneError::MalformedDescriptor(
            "tuple returned by __reduce__ must contain 2 through 5 elements".to_owned(),
        ));
    }

    let callable = parts.get_item(0)?;
    let args = parts.get_item(1)?;
    let optional = |index: usize| -> PyResult<Option<Bound<'py, PyAny>>> {
        if index < size {
            Ok(none_to_option(parts.get_item(index)?))
        } else {
            Ok(None)
        }
    };
    let state = optional(2)?;
    let listitems = optional(3)?;
    let dictitems = optional(4)?;

    if !callable.is_callable() {
        return Err(CloneError::MalformedDescriptor(format!(
            "first item of the tuple returned by __reduce__ must be callable, not {}",
            type_name(&callable)
        )));
    }
    let Ok(args) = args.extract::<Bound<'py, PyTuple>>() else {
        return Err(CloneError::MalformedDescriptor(format!(
            "second item of the tuple returned by __reduce__ must be a tuple, not {}",
            type_name(&args)
        )));
    };
    for (position, items) in [("fourth", &listitems), ("fifth", &dictitems)] {
        if let Some(items) = items {
            if unsafe { ffi::PyIter_Check(items.as_ptr()) } == 0 {
                return Err(CloneError::MalformedDescriptor(format!(
                    "{position} item of the tuple returned by __reduce__ must be an iterator, not {}",
                    type_name(items)
                )));
            }
        }
    }

    Ok(Reduced::Rebuild(Descriptor {
        callable,
        args,
        state,
        listitems,
        dictitems,
    }))
}

/// `cls.__new__(cls, *args, **kwargs)` without running `__init__`.
fn new_instance<'py>(
    cls: &Bound<'py, PyAny>,
    args: &Bound<'py, PyAny>,
    kwargs: Option<&Bound<'py, PyAny>>,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = cls.py();
    let tp = cls.as_ptr().cast::<ffi::PyTypeObject>();
    let Some(tp_new) = (unsafe { (*tp).tp_new }) else {
        return Err(PyTypeError::new_err(format!(
            "cannot create '{}' instances",
            cls.getattr(pyo3::intern!(py, "__qualname__"))?
        ))
        .into());
    };
    let kwargs = kwargs.map_or(std::ptr::null_mut(), |k| k.as_ptr());
    Ok(unsafe { ffi::owned(py, tp_new(tp, args.as_ptr(), kwargs))? })
}

fn is_class(obj: &Bound<'_, PyAny>) -> bool {
    unsafe { ffi::PyType_Check(obj.as_ptr()) != 0 }
}

fn construct<'py, R: Rebuild<'py>>(
    desc: &Descriptor<'py>,
    state: &ModuleState,
    rebuild: &mut R,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = desc.callable.py();
    let args = &desc.args;
    let nargs = args.len();

    if desc.callable.as_ptr() == state.newobj.as_ptr() {
        if nargs < 1 {
            return Err(CloneError::MalformedDescriptor(format!(
                "__newobj__ expected at least 1 argument, got {nargs}"
            )));
        }
        let cls = args.get_item(0)?;
        if !is_class(&cls) {
            return Err(CloneError::MalformedDescriptor(format!(
                "first argument to __newobj__() must be a class, not {}",
                type_name(&cls)
            )));
        }
        let rest = args
            .iter()
            .skip(1)
            .map(|arg| rebuild.child(&arg))
            .collect::<CloneResult<Vec<_>>>()?;
        let rest = PyTuple::new(py, rest)?;
        return new_instance(&cls, rest.as_any(), None);
    }

    if desc.callable.as_ptr() == state.newobj_ex.as_ptr() {
        if nargs != 3 {
            return Err(CloneError::MalformedDescriptor(format!(
                "__newobj_ex__ expected 3 arguments, got {nargs}"
            )));
        }
        let cls = args.get_item(0)?;
        let cls_args = args.get_item(1)?;
        let cls_kwargs = args.get_item(2)?;
        if !is_class(&cls) {
            return Err(CloneError::MalformedDescriptor(format!(
                "first argument to __newobj_ex__() must be a class, not {}",
                type_name(&cls)
            )));
        }
        if unsafe { ffi::PyTuple_Check(cls_args.as_ptr()) } == 0 {
            return Err(CloneError::MalformedDescriptor(format!(
                "second argument to __newobj_ex__() must be a tuple, not {}",
                type_name(&cls_args)
            )));
        }
        if unsafe { ffi::PyDict_Check(cls_kwargs.as_ptr()) } == 0 {
            return Err(CloneError::MalformedDescriptor(format!(
                "third argument to __newobj_ex__() must be a dict, not {}",
                type_name(&cls_kwargs)
            )));
        }
        let args_copy = rebuild.child(&cls_args)?;
        let kwargs_copy = rebuild.child(&cls_kwargs)?;
        return new_instance(&cls, &args_copy, Some(&kwargs_copy));
    }

    let args_copy = args
        .iter()
        .map(|arg| rebuild.child(&arg))
        .collect::<CloneResult<Vec<_>>>()?;
    let args_copy = PyTuple::new(py, args_copy)?;
    Ok(desc.callable.call1(args_copy)?)
}

fn require_dict<'py>(value: &Bound<'py, PyAny>, what: &str) -> CloneResult<()> {
    if unsafe { ffi::PyDict_Check(value.as_ptr()) } == 0 {
        return Err(PyTypeError::new_err(format!("{what} is not a dictionary")).into());
    }
    Ok(())
}

/// BUILD semantics: `__setstate__` if present, else `__dict__` / slot state.
fn apply_state<'py, R: Rebuild<'py>>(
    instance: &Bound<'py, PyAny>,
    state: &Bound<'py, PyAny>,
    rebuild: &mut R,
) -> CloneResult<()> {
    let py = instance.py();
    if let Some(setstate) = optional_attr(instance, pyo3::intern!(py, "__setstate__"))? {
        let state_copy = rebuild.child(state)?;
        setstate.call1((state_copy,))?;
        return Ok(());
    }

    let (dict_state, slot_state) = match state.extract::<Bound<'py, PyTuple>>() {
        Ok(pair) if pair.len() == 2 => (none_to_option(pair.get_item(0)?), none_to_option(pair.get_item(1)?)),
        _ => (Some(state.clone()), None),
    };

    if let Some(dict_state) = dict_state {
        require_dict(&dict_state, "state")?;
        let dict_copy = rebuild.child(&dict_state)?;
        let inst_dict = instance.getattr(pyo3::intern!(py, "__dict__"))?;
        for entry in DictIter::new(&dict_copy) {
            let (key, value) = entry?;
            inst_dict.set_item(key, value)?;
        }
    }
    if let Some(slot_state) = slot_state {
        require_dict(&slot_state, "slot state")?;
        let slots_copy = rebuild.child(&slot_state)?;
        for entry in DictIter::new(&slots_copy) {
            let (key, value) = entry?;
            let name = key
                .extract::<Bound<'py, pyo3::types::PyString>>()
                .map_err(PyErr::from)?;
            instance.setattr(name, value)?;
        }
    }
    Ok(())
}

fn populate<'py, R: Rebuild<'py>>(
    instance: &Bound<'py, PyAny>,
    desc: &Descriptor<'py>,
    rebuild: &mut R,
) -> CloneResult<()> {
    let py = instance.py();
    if let Some(state) = &desc.state {
        apply_state(instance, state, rebuild)?;
    }

    if let Some(listitems) = &desc.listitems {
        let append = instance.getattr(pyo3::intern!(py, "append"))?;
        for item in listitems.try_iter()? {
            let item_copy = rebuild.child(&item?)?;
            append.call1((item_copy,))?;
        }
    }

    if let Some(dictitems) = &desc.dictitems {
        for pair in dictitems.try_iter()? {
            let pair = pair?;
            let pair = match pair.extract::<Bound<'py, PyTuple>>() {
                Ok(pair) if pair.len() == 2 => pair,
                _ => {
                    return Err(PyValueError::new_err("dictiter must yield (key, value) pairs").into())
                }
            };
            let key_copy = rebuild.child(&pair.get_item(0)?)?;
            let value_copy = rebuild.child(&pair.get_item(1)?)?;
            instance.set_item(key_copy, value_copy)?;
        }
    }
    Ok(())
}

/// Rebuild `obj` from the descriptor it reports about itself.
pub fn reconstruct<'py, R: Rebuild<'py>>(
    obj: &Bound<'py, PyAny>,
    state: &ModuleState,
    rebuild: &mut R,
) -> CloneResult<Bound<'py, PyAny>> {
    let desc = match validate(call_reducer(obj, state)?)? {
        Reduced::ByReference => return Ok(obj.clone()),
        Reduced::Rebuild(desc) => desc,
    };

    let instance = construct(&desc, state, rebuild)?;
    rebuild.record(obj, &instance)?;
    if let Err(err) = populate(&instance, &desc, rebuild) {
        rebuild.rollback(obj);
        return Err(err);
    }
    Ok(instance)
}
