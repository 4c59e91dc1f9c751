//! `graphcopy.__about__`: version and authorship metadata
//!
//! - `__version__`, `__version_tuple__` (a `VersionInfo` namedtuple)
//! - `__commit_id__` (`None` unless the build sets `GRAPHCOPY_COMMIT_ID`)
//! - `__build_hash__`, `__authors__` (tuple of `Author` namedtuples)

use pyo3::prelude::*;
use pyo3::types::{PyModule, PyTuple};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_HASH: &str = env!("GRAPHCOPY_BUILD_HASH");
const COMMIT_ID: Option<&str> = option_env!("GRAPHCOPY_COMMIT_ID");

fn component(raw: &str) -> u64 {
    raw.parse().unwrap_or(0)
}

/// Split a semver pre-release (`rc.1`, `dev3`, `a1.dev2`) into `(pre, dev)`.
fn prerelease(raw: &str) -> (Option<String>, Option<u64>) {
    let mut pre = Vec::new();
    let mut dev = None;
    for part in raw.split('.').filter(|part| !part.is_empty()) {
        match part.strip_prefix("dev").and_then(|n| n.parse().ok()) {
            Some(n) => dev = Some(n),
            None => pre.push(part),
        }
    }
    ((!pre.is_empty()).then(|| pre.join(".")), dev)
}

/// `"Name <email>"` -> `("Name", Some("email"))`
fn author(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('<') {
        Some((name, rest)) => (name.trim(), Some(rest.trim_end_matches('>').trim())),
        None => (raw.trim(), None),
    }
}

pub fn build(py: Python<'_>) -> PyResult<Bound<'_, PyModule>> {
    let about = PyModule::new(py, "__about__")?;
    about.add("__version__", VERSION)?;

    let namedtuple = py.import("collections")?.getattr("namedtuple")?;
    let version_info = namedtuple.call1((
        "VersionInfo",
        ["major", "minor", "patch", "pre", "dev", "local"],
    ))?;
    about.add("VersionInfo", &version_info)?;

    let (pre, dev) = prerelease(env!("CARGO_PKG_VERSION_PRE"));
    let version_tuple = version_info.call1((
        component(env!("CARGO_PKG_VERSION_MAJOR")),
        component(env!("CARGO_PKG_VERSION_MINOR")),
        component(env!("CARGO_PKG_VERSION_PATCH")),
        pre,
        dev,
        BUILD_HASH,
    ))?;
    about.add("__version_tuple__", version_tuple)?;
    about.add("__commit_id__", COMMIT_ID)?;
    about.add("__build_hash__", BUILD_HASH)?;

    let author_cls = namedtuple.call1(("Author", ["name", "email"]))?;
    about.add("Author", &author_cls)?;
    let authors = env!("CARGO_PKG_AUTHORS")
        .split(':')
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| author_cls.call1(author(raw)))
        .collect::<PyResult<Vec<_>>>()?;
    about.add("__authors__", PyTuple::new(py, authors)?)?;

    Ok(about)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_prerelease_tags() {
        assert_eq!(prerelease(""), (None, None));
        assert_eq!(prerelease("rc.1"), (Some("rc.1".to_owned()), None));
        assert_eq!(prerelease("dev3"), (None, Some(3)));
        assert_eq!(prerelease("a1.dev2"), (Some("a1".to_owned()), Some(2)));
    }

    #[test]
    fn parses_author_entries() {
        assert_eq!(author("Jane Doe <jane@example.org>"), ("Jane Doe", Some("jane@example.org")));
        assert_eq!(author("graphcopy developers"), ("graphcopy developers", None));
    }

    #[test]
    fn module_carries_version_metadata() {
        Python::attach(|py| {
            let about = build(py).unwrap();
            assert_eq!(
                about.getattr("__version__").unwrap().extract::<String>().unwrap(),
                VERSION
            );
            let version = about.getattr("__version_tuple__").unwrap();
            let major: u64 = version.getattr("major").unwrap().extract().unwrap();
            assert_eq!(major, component(env!("CARGO_PKG_VERSION_MAJOR")));
            assert_eq!(
                version.getattr("local").unwrap().extract::<String>().unwrap(),
                BUILD_HASH
            );
            assert!(version
                .is_instance(&about.getattr("VersionInfo").unwrap())
                .unwrap());

            let authors = about.getattr("__authors__").unwrap();
            assert!(authors.len().unwrap() >= 1);
            let first = authors.get_item(0).unwrap();
            assert!(first.is_instance(&about.getattr("Author").unwrap()).unwrap());
            assert!(about.hasattr("__commit_id__").unwrap());
        });
    }
}
