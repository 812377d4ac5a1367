// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use anyhow::{Result, bail};

#[test]
fn copyright_header() -> Result<()> {
    const REQUIRED_PREFIX: &str =
        "// Copyright (c) Microsoft Corporation.\n// Licensed under the MIT license.\n\n";

    let mut errors: Vec<String> = Vec::new();
    for file in crate::all_rs_files()? {
        let data = fs_err::read_to_string(&file)?;
        if !data.starts_with(REQUIRED_PREFIX) {
            errors.push(format!("expected license header missing from {file:?}"));
        }
    }

    if !errors.is_empty() {
        bail!("Copyright headers test failed:\n\n{}", errors.join("\n"));
    }
    Ok(())
}

#[test]
fn sources_exist_for_every_member() -> Result<()> {
    // A missing member directory means the member list in lib.rs has gone stale.
    for member in crate::MEMBER_DIRS {
        let dir = crate::project_root().join(member);
        anyhow::ensure!(dir.is_dir(), "missing workspace member directory {member:?}");
    }
    Ok(())
}
