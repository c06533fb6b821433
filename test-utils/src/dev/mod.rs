// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for the test suites.  These should not be used in
//! production code.

pub mod poll;

use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
pub use dropshot::test_util::LogContext;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingIfExists;
use dropshot::ConfigLoggingLevel;

/// Set up a [`dropshot::test_util::LogContext`] appropriate for a test named
/// `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: "UNUSED".into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };

    LogContext::new(test_name, &log_config)
}

/// Creates a scratch directory holding a file named `name` for each entry of
/// `files`, with the given contents.  The directory is removed when the
/// returned handle is dropped.
pub fn scratch_dir_with_files(files: &[(&str, &[u8])]) -> Utf8TempDir {
    let dir = camino_tempfile::tempdir().unwrap();
    for (name, contents) in files {
        write_file(dir.path(), name, contents);
    }
    dir
}

fn write_file(dir: &Utf8Path, name: &str, contents: &[u8]) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
}
