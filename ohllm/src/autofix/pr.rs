//! Commit the selected changes and prepare or open the upstream pull request.

use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::autofix::render::render;
use crate::autofix::validate::ValidationSummary;
use crate::core::changes::ChangeSelection;
use crate::core::redaction::Redactor;
use crate::core::types::RunRecord;
use crate::error::Error;
use crate::io::artifacts::{
    PRIVATE_FILE_MODE, read_json, restrict_permissions, write_json_redacted, write_text_redacted,
};
use crate::io::gh::{PrHost, PrRequest};
use crate::io::git::Git;
use crate::io::ledger::RunLayout;

pub const PR_JSON: &str = "autofix_upstream_pr.json";
pub const PR_DRY_RUN_JSON: &str = "autofix_upstream_pr_dry_run.json";
pub const PR_BODY_MD: &str = "autofix_upstream_pr_body.md";

/// Persisted PR record. `url` is `None` for dry runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrRecord {
    pub url: Option<String>,
    pub upstream_repo: String,
    pub base: String,
    pub head: String,
    pub branch: String,
    pub commit: String,
    pub title: String,
    pub draft: bool,
    #[serde(default)]
    pub changes: ChangeSelection,
}

/// Where the branch is pushed and which fork the PR head refers to.
#[derive(Debug, Clone, Default)]
pub struct ForkTarget {
    pub owner: Option<String>,
    pub url: Option<String>,
    pub remote: String,
}

/// Target repository and options for the PR.
#[derive(Debug, Clone)]
pub struct PrTarget {
    pub upstream_repo: String,
    pub base: String,
    pub draft: bool,
}

/// URL from a previously opened PR, if any.
pub fn existing_pr_url(layout: &RunLayout) -> Option<String> {
    let path = layout.artifact(PR_JSON);
    if !path.exists() {
        return None;
    }
    let value: Value = read_json(&path)
        .inspect_err(|err| warn!(%err, "ignoring unreadable PR record"))
        .ok()?;
    value
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

/// `oh-llm autofix: <profile> (<model>) run <run_id>`; used for commit and PR title.
pub fn autofix_title(record: &RunRecord) -> String {
    let model = record
        .profile
        .resolved
        .as_ref()
        .map(|resolved| resolved.model.as_str())
        .filter(|model| !model.is_empty())
        .unwrap_or("unknown");
    format!(
        "oh-llm autofix: {} ({model}) run {}",
        record.profile.name, record.run_id
    )
}

/// Commit the selected changes, returning the commit to publish.
///
/// With nothing selected, a branch that already moved past `base_sha` (a
/// resumed attempt) is published as is. `None` means there is nothing to publish.
#[instrument(skip_all, fields(selected = selection.paths.len()))]
pub fn commit_selection(
    git: &Git,
    selection: &ChangeSelection,
    base_sha: &str,
    message: &str,
) -> Result<Option<String>> {
    if !selection.is_empty() {
        git.add_all()?;
        if !git.reset_paths(&selection.skipped_ephemeral)? {
            warn!(
                paths = selection.skipped_ephemeral.len(),
                "could not unstage ephemeral paths"
            );
        }
        if git.has_staged_changes()? {
            git.commit_with_fallback_identity(message)?;
            let sha = git.head_sha()?;
            info!(commit = %sha, "committed autofix changes");
            return Ok(Some(sha));
        }
        debug!("selection produced no staged changes");
    }
    if git.commits_since(base_sha)? > 0 {
        let sha = git.head_sha()?;
        info!(commit = %sha, "reusing existing autofix commit");
        return Ok(Some(sha));
    }
    Ok(None)
}

/// Render and write `autofix_upstream_pr_body.md`.
pub fn write_pr_body(
    layout: &RunLayout,
    record: &RunRecord,
    git: &Git,
    validation: &ValidationSummary,
    redactor: &Redactor,
) -> Result<PathBuf> {
    let resolved = record.profile.resolved.as_ref();
    let stages: Vec<Value> = validation
        .stages()
        .iter()
        .map(|(name, stage)| json!({"name": name, "ok": stage.ok}))
        .collect();
    let diffstat = git.show_stat("HEAD")?;
    let body = render(
        "pr_body",
        context! {
            profile => &record.profile.name,
            model => resolved.map(|resolved| resolved.model.as_str()),
            base_url => resolved.and_then(|resolved| resolved.base_url.as_deref()),
            run_id => &record.run_id,
            validation_ok => validation.ok,
            stages => stages,
            diffstat => diffstat.trim(),
        },
    )?;
    let path = layout.artifact(PR_BODY_MD);
    write_text_redacted(&path, &body, redactor)?;
    restrict_permissions(&path, PRIVATE_FILE_MODE);
    Ok(path)
}

/// Everything the PR step needs once a commit exists.
pub struct Publication<'a> {
    pub layout: &'a RunLayout,
    pub git: &'a Git,
    pub branch: &'a str,
    pub commit: &'a str,
    pub title: &'a str,
    pub body_path: PathBuf,
    pub changes: &'a ChangeSelection,
    pub target: &'a PrTarget,
    pub redactor: &'a Redactor,
}

impl Publication<'_> {
    fn record(&self, url: Option<String>, head: String) -> PrRecord {
        PrRecord {
            url,
            upstream_repo: self.target.upstream_repo.clone(),
            base: self.target.base.clone(),
            head,
            branch: self.branch.to_string(),
            commit: self.commit.to_string(),
            title: self.title.to_string(),
            draft: self.target.draft,
            changes: self.changes.clone(),
        }
    }

    fn persist(&self, name: &str, record: &PrRecord) -> Result<()> {
        let path = self.layout.artifact(name);
        write_json_redacted(&path, record, self.redactor)?;
        restrict_permissions(&path, PRIVATE_FILE_MODE);
        Ok(())
    }

    /// Record what would be published without touching any remote.
    pub fn dry_run(&self, fork: &ForkTarget) -> Result<PrRecord> {
        let head = match &fork.owner {
            Some(owner) => format!("{owner}:{}", self.branch),
            None => self.branch.to_string(),
        };
        let record = self.record(None, head);
        self.persist(PR_DRY_RUN_JSON, &record)?;
        info!("dry run: skipping push and PR creation");
        Ok(record)
    }

    /// Push the branch to the fork, returning the PR head `<owner>:<branch>`.
    ///
    /// The worktree must still be on the recorded branch.
    #[instrument(skip_all, fields(branch = self.branch, remote = %fork.remote))]
    pub fn push<H: PrHost>(&self, host: &H, fork: &ForkTarget) -> Result<String> {
        let current = self.git.current_branch()?;
        if current != self.branch {
            return Err(Error::Config(format!(
                "worktree {} is on branch `{current}`, expected `{}`",
                self.git.workdir().display(),
                self.branch
            ))
            .into());
        }
        let owner = match &fork.owner {
            Some(owner) => owner.clone(),
            None => host
                .current_login(self.git.workdir())
                .context("resolve fork owner")?,
        };
        let fork_url = match &fork.url {
            Some(url) => url.clone(),
            None => default_fork_url(&owner, &self.target.upstream_repo)?,
        };
        self.git.ensure_remote(&fork.remote, &fork_url)?;
        self.git.push_upstream(&fork.remote, self.branch)?;
        Ok(format!("{owner}:{}", self.branch))
    }

    /// Open the PR for an already pushed `head` and persist its record.
    pub fn open_pr<H: PrHost>(&self, host: &H, head: String) -> Result<PrRecord> {
        let url = host.create_pr(&PrRequest {
            workdir: self.git.workdir().to_path_buf(),
            repo: self.target.upstream_repo.clone(),
            base: self.target.base.clone(),
            head: head.clone(),
            title: self.title.to_string(),
            body_path: self.body_path.clone(),
            draft: self.target.draft,
        })?;
        let record = self.record(Some(url), head);
        self.persist(PR_JSON, &record)?;
        Ok(record)
    }
}

/// `https://github.com/<owner>/<repo name>.git` for an `owner/name` upstream.
pub fn default_fork_url(owner: &str, upstream_repo: &str) -> Result<String> {
    let name = upstream_repo
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "upstream repo `{upstream_repo}` is not of the form owner/name"
            ))
        })?;
    Ok(format!("https://github.com/{owner}/{name}.git"))
}
