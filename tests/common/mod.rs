#![allow(dead_code)]

use std::sync::Once;

use small_store::utils::init_log;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(init_log);
}

/// A per-process temp file path, so parallel test binaries do not step
/// on each other.
pub fn temp_file(name: &str) -> String {
    let dir = std::env::temp_dir().join("small-store-tests");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{}_{}", std::process::id(), name))
        .to_str()
        .unwrap()
        .to_string()
}
