use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};

fn main() {
    // Py_3_14 and friends gate the dict watcher path in dict_iter.rs.
    pyo3_build_config::use_pyo3_cfgs();
    pyo3_build_config::add_extension_module_link_args();

    // `__about__.__build_hash__`: wheel builds pass their own, local builds derive one.
    println!("cargo:rerun-if-env-changed=GRAPHCOPY_BUILD_HASH");
    println!("cargo:rerun-if-env-changed=GRAPHCOPY_COMMIT_ID");
    let build_hash = env::var("GRAPHCOPY_BUILD_HASH").unwrap_or_else(|_| {
        let mut hasher = DefaultHasher::new();
        for key in ["CARGO_PKG_VERSION", "TARGET", "PROFILE", "GRAPHCOPY_COMMIT_ID"] {
            env::var(key).unwrap_or_default().hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    });
    println!("cargo:rustc-env=GRAPHCOPY_BUILD_HASH={build_hash}");
}
