// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};

/// First positional argument, or `config.yaml` next to the working
/// directory.
pub fn config_path_from_args() -> String {
    std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_owned())
}

/// Turn a possibly-relative config path into a canonical absolute one,
/// checking that it actually points at a file.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let given = Path::new(rel);
    let abs = if given.is_absolute() {
        given.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(given)
    };

    ensure!(abs.exists(), "config {} does not exist", abs.display());
    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {}", abs.display()))?;
    ensure!(canon.is_file(), "config {} is not a file", canon.display());

    Ok(canon)
}
