//! Pull-request host abstraction over the `gh` CLI.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use tracing::{info, instrument};

use crate::error::Error;
use crate::io::process::{describe_command, run_captured};

/// Parameters for `gh pr create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub workdir: PathBuf,
    /// `owner/name` of the target repository.
    pub repo: String,
    pub base: String,
    /// `<fork-owner>:<branch>`.
    pub head: String,
    pub title: String,
    pub body_path: PathBuf,
    pub draft: bool,
}

pub trait PrHost {
    /// Login of the authenticated user, used as the default fork owner.
    fn current_login(&self, workdir: &Path) -> Result<String>;

    /// Open a pull request and return its URL.
    fn create_pr(&self, request: &PrRequest) -> Result<String>;
}

pub struct GhCli {
    bin: String,
}

impl GhCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn capture(&self, mut cmd: Command) -> Result<String> {
        cmd.env("NO_COLOR", "1").env("GH_PROMPT_DISABLED", "1");
        let command = describe_command(&cmd).join(" ");
        let output = run_captured(cmd)?;
        if !output.status.success() {
            return Err(Error::ExternalProcess {
                command,
                output: output.stderr_text().trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout_text().trim().to_string())
    }
}

impl PrHost for GhCli {
    fn current_login(&self, workdir: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["api", "user", "--jq", ".login"])
            .current_dir(workdir);
        let login = self.capture(cmd)?;
        if login.is_empty() {
            return Err(Error::Config(
                "`gh api user` returned no login; pass --fork-owner".to_string(),
            )
            .into());
        }
        Ok(login)
    }

    #[instrument(skip_all, fields(repo = %request.repo, head = %request.head))]
    fn create_pr(&self, request: &PrRequest) -> Result<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["pr", "create", "--repo", &request.repo])
            .args(["--base", &request.base])
            .args(["--head", &request.head])
            .args(["--title", &request.title])
            .arg("--body-file")
            .arg(&request.body_path)
            .current_dir(&request.workdir);
        if request.draft {
            cmd.arg("--draft");
        }
        let url = self.capture(cmd)?;
        if url.is_empty() {
            return Err(Error::ExternalProcess {
                command: "gh pr create".to_string(),
                output: "no PR URL on stdout".to_string(),
            }
            .into());
        }
        info!(url = %url, "pull request opened");
        Ok(url)
    }
}
