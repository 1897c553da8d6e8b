//! Ephemeral git worktrees of the agent runtime checkout.
//!
//! Each autofix attempt works in its own worktree, pinned to the base
//! checkout's HEAD at creation time, on a branch whose name is a pure function
//! of the profile and run id.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::naming::derive_branch_name;
use crate::env::{Env, timestamp};
use crate::error::Error;
use crate::io::artifacts::{PRIVATE_FILE_MODE, read_json, restrict_permissions, write_json};
use crate::io::git::Git;

pub const WORKTREE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseCheckout {
    pub path: PathBuf,
    pub base_sha: String,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub keep_worktree: bool,
    pub cleaned_up: bool,
}

/// Contents of `autofix_worktree.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub schema_version: u32,
    pub created_at: String,
    #[serde(rename = "agent_sdk")]
    pub base: BaseCheckout,
    pub worktree: WorktreeInfo,
}

impl WorktreeRecord {
    pub fn path(&self) -> &Path {
        &self.worktree.path
    }

    pub fn branch(&self) -> &str {
        &self.worktree.branch
    }
}

#[derive(Debug, Clone)]
pub struct WorktreeRequest<'a> {
    pub base_path: &'a Path,
    pub target_path: &'a Path,
    pub profile_name: &'a str,
    pub run_id: &'a str,
    pub allow_dirty: bool,
    pub keep_worktree: bool,
}

/// Create a worktree at `request.target_path` on the derived branch.
///
/// A dirty base checkout is refused before anything is created unless
/// `allow_dirty` is set. An existing target path is also refused.
#[instrument(skip_all, fields(base = %request.base_path.display(), target = %request.target_path.display()))]
pub fn create_worktree(env: &dyn Env, request: &WorktreeRequest<'_>) -> Result<WorktreeRecord> {
    if !request.base_path.is_dir() {
        return Err(Error::Config(format!(
            "agent SDK checkout not found: {}",
            request.base_path.display()
        ))
        .into());
    }
    let git = Git::new(request.base_path);
    let base_sha = git.head_sha().context("read base HEAD")?;
    let dirty = git.is_dirty().context("read base status")?;
    if dirty && !request.allow_dirty {
        warn!("base checkout dirty, refusing");
        return Err(Error::DirtyBase(request.base_path.to_path_buf()).into());
    }
    if let Some(parent) = request.target_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    if request.target_path.exists() {
        return Err(Error::InvalidInput(format!(
            "worktree path already exists: {}",
            request.target_path.display()
        ))
        .into());
    }

    let branch = derive_branch_name(request.profile_name, request.run_id);
    git.worktree_add(&branch, request.target_path, &base_sha)?;
    info!(branch = %branch, base_sha = %base_sha, dirty, "worktree created");

    Ok(WorktreeRecord {
        schema_version: WORKTREE_SCHEMA_VERSION,
        created_at: timestamp(env.now()),
        base: BaseCheckout {
            path: request.base_path.to_path_buf(),
            base_sha,
            dirty,
        },
        worktree: WorktreeInfo {
            path: request.target_path.to_path_buf(),
            branch,
            keep_worktree: request.keep_worktree,
            cleaned_up: false,
        },
    })
}

/// Remove the worktree, then delete its branch on a best-effort basis.
#[instrument(skip_all, fields(branch))]
pub fn cleanup_worktree(base_path: &Path, target_path: &Path, branch: &str) -> Result<()> {
    let git = Git::new(base_path);
    git.worktree_remove_force(target_path)?;
    if let Err(err) = git.delete_branch(branch) {
        warn!(%err, "branch delete failed after worktree removal");
    }
    Ok(())
}

/// Copy of `record` with `cleaned_up` set.
pub fn mark_cleaned(record: &WorktreeRecord) -> WorktreeRecord {
    let mut cleaned = record.clone();
    cleaned.worktree.cleaned_up = true;
    cleaned
}

pub fn write_worktree_record(path: &Path, record: &WorktreeRecord) -> Result<()> {
    write_json(path, record)?;
    restrict_permissions(path, PRIVATE_FILE_MODE);
    Ok(())
}

pub fn load_worktree_record(path: &Path) -> Result<WorktreeRecord> {
    read_json(path)
}
