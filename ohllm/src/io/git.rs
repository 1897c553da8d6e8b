//! Git adapter.
//!
//! Worktree creation, change staging and pushes all go through this small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::Error;

/// Identity used for commits when the repository has none configured.
pub const FALLBACK_USER_NAME: &str = "oh-llm";
pub const FALLBACK_USER_EMAIL: &str = "oh-llm@example.invalid";

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Raw `git status --porcelain=v1` output, leading spaces preserved.
    ///
    /// Untracked directories are expanded so every file is listed on its own line.
    pub fn status_porcelain(&self) -> Result<String> {
        self.run_capture(&["status", "--porcelain=v1", "--untracked-files=all"])
    }

    /// True when tracked or untracked changes exist.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.trim().is_empty())
    }

    /// Unstaged and staged diff against HEAD, without color.
    pub fn diff_head(&self) -> Result<String> {
        self.run_capture(&["diff", "--no-color", "HEAD"])
    }

    /// `git show --stat --oneline` for `rev`.
    pub fn show_stat(&self, rev: &str) -> Result<String> {
        self.run_capture(&["show", "--stat", "--oneline", "--no-color", rev])
    }

    /// Number of commits reachable from HEAD but not from `base`.
    pub fn commits_since(&self, base: &str) -> Result<u64> {
        let range = format!("{base}..HEAD");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// Create `path` as a new worktree on a new `branch` starting at `base_sha`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, branch: &str, path: &Path, base_sha: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        debug!("adding worktree");
        self.run_checked(&["worktree", "add", "-b", branch, &path_arg, base_sha])?;
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove_force(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        debug!("removing worktree");
        self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Unstage `paths`. Returns whether git reported success.
    pub fn reset_paths(&self, paths: &[String]) -> Result<bool> {
        if paths.is_empty() {
            return Ok(true);
        }
        let mut args = vec!["reset", "--"];
        args.extend(paths.iter().map(String::as_str));
        let output = self.run(&args)?;
        Ok(output.status.success())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Value of a config key, or `None` when unset or blank.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let output = self.run(&["config", "--get", key])?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }

    /// Commit staged changes, injecting a fallback identity only where none is configured.
    #[instrument(skip_all)]
    pub fn commit_with_fallback_identity(&self, message: &str) -> Result<()> {
        let mut args: Vec<String> = Vec::new();
        if self.config_get("user.name")?.is_none() {
            args.extend(["-c".to_string(), format!("user.name={FALLBACK_USER_NAME}")]);
        }
        if self.config_get("user.email")?.is_none() {
            args.extend([
                "-c".to_string(),
                format!("user.email={FALLBACK_USER_EMAIL}"),
            ]);
        }
        args.extend(["commit".to_string(), "-m".to_string(), message.to_string()]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(injected_identity = args.len() > 3, "committing staged changes");
        self.run_checked(&refs)?;
        Ok(())
    }

    pub fn remote_url(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["remote", "get-url", name])?;
        if !output.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!url.is_empty()).then_some(url))
    }

    /// Point remote `name` at `url`, adding it when missing.
    #[instrument(skip_all, fields(remote = name))]
    pub fn ensure_remote(&self, name: &str, url: &str) -> Result<()> {
        match self.remote_url(name)? {
            Some(current) if current == url => {
                debug!("remote already configured");
            }
            Some(_) => {
                debug!("updating remote url");
                self.run_checked(&["remote", "set-url", name, url])?;
            }
            None => {
                debug!("adding remote");
                self.run_checked(&["remote", "add", name, url])?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_upstream(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalProcess {
                command: format!("git {}", args.join(" ")),
                output: stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
