//! Artifact writers.
//!
//! Anything that may carry provider output goes through the `*_redacted`
//! writers. The plain writers are for records that hold only names and paths
//! (profiles, worktree records).

use std::ffi::OsString;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::redaction::Redactor;

/// Owner read/write only.
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Owner read/write/execute only.
pub const PRIVATE_SCRIPT_MODE: u32 = 0o700;

/// Serialize `value`, redact it, and write it atomically.
pub fn write_json_redacted<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    redactor: &Redactor,
) -> Result<()> {
    let payload = redactor
        .to_json(value)
        .with_context(|| format!("render {}", path.display()))?;
    write_atomic(path, &payload)
}

pub fn write_text_redacted(path: &Path, text: &str, redactor: &Redactor) -> Result<()> {
    write_atomic(path, &redactor.redact_text(text))
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(path, &payload)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Write through a sibling temp file and rename over the target.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name: OsString = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Best-effort permission tightening. Failures are logged, never returned.
pub fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            debug!(path = %path.display(), mode = %format!("{mode:o}"), %err, "could not tighten permissions");
        }
    }
    #[cfg(not(unix))]
    {
        debug!(path = %path.display(), mode = %format!("{mode:o}"), "permission tightening unsupported on this platform");
    }
}
