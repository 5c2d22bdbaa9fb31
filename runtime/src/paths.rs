//! Per-user cache and runtime directory resolution.
//!
//! Two directories with different purposes, following the freedesktop base
//! directory conventions:
//!
//! 1. The runtime directory, usually tmpfs. Lock files go here.
//! 2. The cache directory, on disk. Extracted bundles go here.
//!
//! Each resolver walks an override/XDG/fallback chain and creates the
//! directory on first use.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Resolves the cache directory.
///
/// Tried in order: `$SLASH_CACHE_PATH`, `$XDG_CACHE_HOME/SLASH/vrt`,
/// `$HOME/.cache/SLASH/vrt`, `/tmp/SLASH-cache-<uid>/vrt`.
pub fn cache_dir() -> Result<PathBuf> {
    let path = if let Some(overridden) = env_path("SLASH_CACHE_PATH") {
        overridden
    } else if let Some(xdg) = env_path("XDG_CACHE_HOME") {
        xdg.join("SLASH").join("vrt")
    } else if let Some(home) = env_path("HOME") {
        home.join(".cache").join("SLASH").join("vrt")
    } else {
        PathBuf::from(format!("/tmp/SLASH-cache-{}/vrt", uid()))
    };
    ensure_dir(&path)?;
    Ok(path)
}

/// Resolves the runtime directory.
///
/// Tried in order: `$SLASH_RUNTIME_PATH`, `$XDG_RUNTIME_DIR/SLASH/vrt`,
/// `/tmp/SLASH-run-<uid>/vrt`.
pub fn runtime_dir() -> Result<PathBuf> {
    let path = if let Some(overridden) = env_path("SLASH_RUNTIME_PATH") {
        overridden
    } else if let Some(xdg) = env_path("XDG_RUNTIME_DIR") {
        xdg.join("SLASH").join("vrt")
    } else {
        PathBuf::from(format!("/tmp/SLASH-run-{}/vrt", uid()))
    };
    ensure_dir(&path)?;
    Ok(path)
}

/// The per-BDF metadata root, `$AMI_HOME`.
///
/// Unset is only an error on paths that must persist hardware metadata, so
/// the caller decides when to treat `None` as fatal.
pub fn ami_home() -> Option<PathBuf> {
    env_path("AMI_HOME")
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn uid() -> u32 {
    // SAFETY: getuid has no failure modes and touches no shared state.
    unsafe { libc::getuid() }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| Error::os(format!("creating directory {}", path.display()), e))
}
