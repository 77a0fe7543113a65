#![allow(dead_code)]

use std::io::Write;

use tempfile::NamedTempFile;

pub use workdag_test_utils::builders;
pub use workdag_test_utils::fake_handlers;
pub use workdag_test_utils::harness;
pub use workdag_test_utils::{init_tracing, with_timeout, with_timeout_of};

/// Write `contents` to a temporary `.toml` file.
pub fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    write!(file, "{contents}").unwrap();
    file
}
