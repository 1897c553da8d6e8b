//! Agent runtime checkout inspection (`sdk status`, `sdk info`, `sdk check-import`,
//! run snapshots).

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::SdkSnapshot;
use crate::env::Env;
use crate::error::Error;
use crate::io::git::Git;
use crate::io::probe::parse_probe_payload;
use crate::io::process::{find_executable, run_captured};

const IMPORT_CHECK: &str = "import json; import openhands.sdk; \
print(json.dumps({'ok': True, 'module_file': openhands.sdk.__file__}))";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSdkInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub git_sha: Option<String>,
    pub git_dirty: Option<bool>,
    pub uv_available: bool,
}

impl AgentSdkInfo {
    /// Reasons the checkout cannot run probes, empty when healthy.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.exists {
            problems.push(format!(
                "agent SDK checkout not found at {}",
                self.path.display()
            ));
        } else if self.git_sha.is_none() {
            problems.push(format!("{} is not a git checkout", self.path.display()));
        }
        if !self.uv_available {
            problems.push("`uv` not found on PATH".to_string());
        }
        problems
    }

    pub fn snapshot(&self) -> SdkSnapshot {
        SdkSnapshot {
            path: self.path.display().to_string(),
            git_sha: self.git_sha.clone(),
            git_dirty: self.git_dirty,
        }
    }
}

/// Inspect `path`. Git failures are reported as missing fields, never as errors.
pub fn collect_sdk_info(env: &dyn Env, path: &Path, uv_bin: &str) -> AgentSdkInfo {
    let exists = path.is_dir();
    let (git_sha, git_dirty) = if exists {
        let git = Git::new(path);
        let sha = git
            .head_sha()
            .inspect_err(|err| debug!(%err, "could not read agent SDK HEAD"))
            .ok();
        let dirty = git
            .is_dirty()
            .inspect_err(|err| debug!(%err, "could not read agent SDK status"))
            .ok();
        (sha, dirty)
    } else {
        (None, None)
    };
    AgentSdkInfo {
        path: path.to_path_buf(),
        exists,
        git_sha,
        git_dirty,
        uv_available: find_executable(env, uv_bin).is_some(),
    }
}

/// Result of importing the agent SDK inside its own `uv` environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportCheck {
    pub ok: bool,
    pub path: PathBuf,
    /// Where the imported package lives; `None` when the import failed.
    pub module_file: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Import `openhands.sdk` through `uv run` in the checkout at `path`.
///
/// A missing checkout or `uv` is a configuration error; a failing import is
/// reported with `ok: false`.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn check_import(env: &dyn Env, path: &Path, uv_bin: &str) -> Result<ImportCheck> {
    if !path.is_dir() {
        return Err(Error::Config(format!(
            "agent SDK checkout not found at {}",
            path.display()
        ))
        .into());
    }
    let uv = find_executable(env, uv_bin)
        .ok_or_else(|| Error::Config(format!("`{uv_bin}` not found on PATH")))?;
    let mut cmd = Command::new(uv);
    cmd.arg("--directory")
        .arg(path)
        .args(["run", "python", "-c", IMPORT_CHECK])
        .env_remove("VIRTUAL_ENV")
        .env("NO_COLOR", "1");
    let output = run_captured(cmd)?;
    let stdout = output.stdout_text();
    let module_file = parse_probe_payload(&stdout)
        .filter(|payload| payload.get("ok").and_then(Value::as_bool) == Some(true))
        .and_then(|payload| {
            payload
                .get("module_file")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    debug!(exit_code = ?output.status.code(), found = module_file.is_some(), "import check finished");
    Ok(ImportCheck {
        ok: output.status.success() && module_file.is_some(),
        path: path.to_path_buf(),
        module_file,
        exit_code: output.status.code(),
        stdout,
        stderr: output.stderr_text(),
    })
}
