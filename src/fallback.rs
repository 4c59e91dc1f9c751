//! Recovery for `__deepcopy__` hooks that reject the native memo
//!
//! Some hooks assume `memo` is a real `dict` (isinstance asserts, dict-only
//! methods). When such a hook raises `TypeError`/`AssertionError`, the entries it
//! managed to add are rolled back, it is retried once with a plain dict snapshot,
//! and whatever the retry recorded is folded back into the native memo. A
//! `UserWarning` tells the user how to avoid the slow path.

use std::ffi::CString;

use pyo3::exceptions::{PyAssertionError, PyTypeError, PyUserWarning};
use pyo3::prelude::*;

use crate::config::{self, Config, ENV_NO_MEMO_FALLBACK, ENV_NO_MEMO_FALLBACK_WARNING, ENV_USE_DICT_MEMO};
use crate::error::CloneResult;
use crate::proxy::MemoObject;
use crate::state::NativeMemo;

fn rejects_memo(py: Python<'_>, err: &PyErr) -> bool {
    err.is_instance_of::<PyTypeError>(py) || err.is_instance_of::<PyAssertionError>(py)
}

/// Call `hook(memo)`, retrying with a dict memo if the native one is rejected.
pub fn call_hook<'py>(
    hook: &Bound<'py, PyAny>,
    memo: &mut NativeMemo<'py>,
) -> CloneResult<Bound<'py, PyAny>> {
    call_hook_with(hook, memo, config::get())
}

pub(crate) fn call_hook_with<'py>(
    hook: &Bound<'py, PyAny>,
    memo: &mut NativeMemo<'py>,
    config: &Config,
) -> CloneResult<Bound<'py, PyAny>> {
    let py = hook.py();
    let checkpoint = memo.checkpoint()?;
    let err = match hook.call1((memo.object(),)) {
        Ok(copy) => {
            memo.commit();
            return Ok(copy);
        }
        Err(err) => err,
    };
    memo.rollback(checkpoint);

    if !config.memo_fallback || !rejects_memo(py, &err) {
        return Err(err.into());
    }

    let dict = MemoObject::to_dict(memo.object())?;
    let copy = hook.call1((&dict,))?;
    memo.absorb_dict(&dict, checkpoint.keep_len)?;

    let identifier = err.to_string();
    log::debug!("memo rejected by {hook}; recovered with a dict memo ({identifier})");
    if !config.fallback_warning.silences(&identifier) {
        warn(py, hook, &identifier)?;
    }
    Ok(copy)
}

/// `module.Type.__deepcopy__` for the owner of a bound hook.
fn hook_qualname(hook: &Bound<'_, PyAny>) -> String {
    let py = hook.py();
    let owner = hook
        .getattr(pyo3::intern!(py, "__self__"))
        .map(|receiver| receiver.get_type());
    match owner {
        Ok(tp) => {
            let module = tp
                .module()
                .map(|m| m.to_string())
                .unwrap_or_else(|_| "__main__".to_owned());
            let name = tp.qualname().map(|n| n.to_string()).unwrap_or_else(|_| "?".to_owned());
            format!("{module}.{name}.__deepcopy__")
        }
        Err(_) => hook
            .getattr(pyo3::intern!(py, "__qualname__"))
            .map(|name| name.to_string())
            .unwrap_or_else(|_| "__deepcopy__".to_owned()),
    }
}

fn warning_text(qualname: &str, identifier: &str) -> String {
    format!(
        "\n\n\
         Seems like 'graphcopy.Memo' was rejected inside '{qualname}':\n\
         \n\
         {identifier}\n\
         \n\
         graphcopy was able to recover from this error, but this is slow and unreliable.\n\
         \n\
         Fix:\n\
         \n\
         \x20 Per Python docs, '{qualname}' should treat memo as an opaque object.\n\
         \x20 See: https://docs.python.org/3/library/copy.html#object.__deepcopy__\n\
         \n\
         Workarounds:\n\
         \n\
         \x20   local  pass memo={{}} to deepcopy()\n\
         \x20          -> graphcopy uses dict memo in this call (recommended)\n\
         \n\
         \x20  global  export {ENV_USE_DICT_MEMO}=1\n\
         \x20          -> graphcopy uses dict memo everywhere\n\
         \n\
         \x20  silent  export {ENV_NO_MEMO_FALLBACK_WARNING}='{identifier}'\n\
         \x20          -> this hook stays slow to deepcopy\n\
         \n\
         explosive  export {ENV_NO_MEMO_FALLBACK}=1\n\
         \x20          -> this hook raises the error above\n"
    )
}

fn warn(py: Python<'_>, hook: &Bound<'_, PyAny>, identifier: &str) -> PyResult<()> {
    let text = warning_text(&hook_qualname(hook), identifier).replace('\0', "");
    let message = CString::new(text)?;
    let category = py.get_type::<PyUserWarning>();
    PyErr::warn(py, category.as_any(), &message, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo_trait::{identity, Memo};
    use pyo3::types::PyDict;

    const STUBBORN: &std::ffi::CStr = c"
import warnings

class Stubborn:
    def __init__(self):
        self.payload = [1, 2]
    def __deepcopy__(self, memo):
        assert isinstance(memo, dict), 'memo must be a dict'
        clone = Stubborn()
        clone.payload = list(self.payload)
        memo[id(self.payload)] = clone.payload
        return clone

obj = Stubborn()
";

    #[test]
    fn retries_with_dict_and_warns() {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            py.run(STUBBORN, Some(&globals), None).unwrap();
            let obj = globals.get_item("obj").unwrap().unwrap();
            let hook = obj.getattr("__deepcopy__").unwrap();
            let mut memo = NativeMemo::new(Bound::new(py, MemoObject::default()).unwrap());

            let warnings = py.import("warnings").unwrap();
            let kwargs = PyDict::new(py);
            kwargs.set_item("record", true).unwrap();
            let catcher = warnings.call_method("catch_warnings", (), Some(&kwargs)).unwrap();
            let caught = catcher.call_method0("__enter__").unwrap();
            warnings.call_method1("simplefilter", ("always",)).unwrap();
            let copy = call_hook_with(&hook, &mut memo, &Config::from_lookup(|_| None)).unwrap();
            catcher
                .call_method1("__exit__", (py.None(), py.None(), py.None()))
                .unwrap();

            assert_eq!(copy.get_type().as_ptr(), obj.get_type().as_ptr());
            let payload = obj.getattr("payload").unwrap();
            let found = memo.lookup(identity(&payload)).unwrap().unwrap();
            assert_eq!(found.as_ptr(), copy.getattr("payload").unwrap().as_ptr());

            assert_eq!(caught.len().unwrap(), 1);
            let message = caught.get_item(0).unwrap().getattr("message").unwrap().to_string();
            assert!(message.contains("AssertionError: memo must be a dict"), "{message}");
            assert!(message.contains("Stubborn.__deepcopy__"), "{message}");
        });
    }

    #[test]
    fn unrelated_errors_propagate() {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            py.run(
                c"
class Broken:
    def __deepcopy__(self, memo):
        raise KeyError('nope')
obj = Broken()
",
                Some(&globals),
                None,
            )
            .unwrap();
            let hook = globals.get_item("obj").unwrap().unwrap().getattr("__deepcopy__").unwrap();
            let mut memo = NativeMemo::new(Bound::new(py, MemoObject::default()).unwrap());
            let err: PyErr = call_hook(&hook, &mut memo).unwrap_err().into();
            assert!(err.is_instance_of::<pyo3::exceptions::PyKeyError>(py));
        });
    }

    #[test]
    fn disabled_fallback_propagates_and_rolls_back() {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            py.run(
                c"
class Picky:
    def __init__(self):
        self.payload = [1]
    def __deepcopy__(self, memo):
        memo[id(self.payload)] = list(self.payload)
        raise TypeError('memo must be a dict')
picky = Picky()
",
                Some(&globals),
                None,
            )
            .unwrap();
            let picky = globals.get_item("picky").unwrap().unwrap();
            let hook = picky.getattr("__deepcopy__").unwrap();
            let mut memo = NativeMemo::new(Bound::new(py, MemoObject::default()).unwrap());
            let config = Config::from_lookup(|name| (name == ENV_NO_MEMO_FALLBACK).then(|| "1".to_owned()));

            let err: PyErr = call_hook_with(&hook, &mut memo, &config).unwrap_err().into();
            assert!(err.is_instance_of::<PyTypeError>(py));
            assert_eq!(err.value(py).to_string(), "memo must be a dict");
            let payload = picky.getattr("payload").unwrap();
            assert!(memo.lookup(identity(&payload)).unwrap().is_none());
            assert_eq!(memo.object().borrow().table.len(), 0);
        });
    }

    #[test]
    fn warning_mentions_every_workaround() {
        let text = warning_text("m.T.__deepcopy__", "TypeError: boom");
        for needle in [ENV_USE_DICT_MEMO, ENV_NO_MEMO_FALLBACK, ENV_NO_MEMO_FALLBACK_WARNING, "TypeError: boom"] {
            assert!(text.contains(needle), "{needle}");
        }
    }
}
