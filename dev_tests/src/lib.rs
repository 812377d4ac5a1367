// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! This crate only makes sense in testing mode
#![cfg(test)]

use anyhow::Result;
use std::path::{Path, PathBuf};

mod boilerplate;

/// The workspace member directories whose sources are subject to the hygiene tests.
///
/// Kept explicit (rather than walking the whole tree) so that build artifacts and vendored
/// reference material never end up in scope by accident.
const MEMBER_DIRS: &[&str] = &[
    "syncport",
    "syncport_platform_windows_userland",
    "syncport_platform_linux_userland",
    "dev_tests",
];

/// The workspace root (the parent of this crate's manifest directory).
pub(crate) fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("dev_tests sits directly under the workspace root")
        .to_owned()
}

/// Get all `.rs` source files of the workspace members.
pub(crate) fn all_rs_files() -> Result<Vec<PathBuf>> {
    let root = project_root();
    let mut files = Vec::new();
    for member in MEMBER_DIRS {
        collect_rs_files(&root.join(member), &mut files)?;
    }
    Ok(files)
}

fn collect_rs_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs_err::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == "target") {
                continue;
            }
            collect_rs_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
    Ok(())
}
