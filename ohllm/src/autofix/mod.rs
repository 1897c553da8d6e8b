//! Autofix: turn a failed run into a validated upstream pull request.
//!
//! The pipeline is a linear state machine:
//!
//! ```text
//! Gated -> WorktreeReady -> AgentRan -> Validated -> Committed -> Pushed -> PrOpened
//!                                                             \-> DryRunComplete
//! ```
//!
//! Every transition is appended to the run log. Each step leaves its artifacts
//! under `artifacts/`, which lets a second invocation on the same run skip work
//! that already happened (an opened PR, a kept worktree that already validated).

pub mod capsule;
pub mod invoke;
pub mod pr;
pub mod render;
pub mod steps;
pub mod validate;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::autofix::capsule::write_capsule;
use crate::autofix::invoke::AgentStep;
use crate::autofix::pr::{
    ForkTarget, PrTarget, Publication, autofix_title, commit_selection, existing_pr_url,
    write_pr_body,
};
use crate::autofix::validate::{load_validation, validate_worktree};
use crate::core::changes::{ChangeSelection, select_changes};
use crate::core::failure::{effective_classification, failure_from_stages};
use crate::core::redaction::Redactor;
use crate::core::types::{Classification, RunRecord};
use crate::env::Env;
use crate::error::Error;
use crate::io::agent::CodingAgent;
use crate::io::config::StageConfig;
use crate::io::gh::PrHost;
use crate::io::git::Git;
use crate::io::ledger::{RunLayout, append_log, read_run_record};
use crate::io::probe::ProbeRunner;
use crate::io::worktree::{
    WorktreeRecord, WorktreeRequest, cleanup_worktree, create_worktree, load_worktree_record,
    mark_cleaned, write_worktree_record,
};

pub const WORKTREE_DIR: &str = "autofix_sdk_worktree";
pub const WORKTREE_JSON: &str = "autofix_worktree.json";

#[derive(Debug, Clone)]
pub struct AutofixOptions {
    /// Base agent SDK checkout the worktree is created from.
    pub sdk_path: PathBuf,
    pub force: bool,
    pub dry_run: bool,
    pub keep_worktree: bool,
    pub allow_dirty_sdk: bool,
    pub fork: ForkTarget,
    pub target: PrTarget,
    pub stages: StageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofixState {
    Gated,
    WorktreeReady,
    AgentRan,
    Validated,
    Committed,
    Pushed,
    PrOpened,
    DryRunComplete,
}

impl AutofixState {
    pub fn as_str(self) -> &'static str {
        match self {
            AutofixState::Gated => "gated",
            AutofixState::WorktreeReady => "worktree_ready",
            AutofixState::AgentRan => "agent_ran",
            AutofixState::Validated => "validated",
            AutofixState::Committed => "committed",
            AutofixState::Pushed => "pushed",
            AutofixState::PrOpened => "pr_opened",
            AutofixState::DryRunComplete => "dry_run_complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// The failure points at the user's credentials or settings, not at code.
    CredentialOrConfig,
    NoFailure,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefusalReason::CredentialOrConfig => "credential_or_config",
            RefusalReason::NoFailure => "no_failure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutofixOutcome {
    Refused { reason: RefusalReason },
    AlreadyOpened { url: String },
    ValidationFailed,
    NoChanges,
    DryRunComplete,
    PrOpened { url: String },
}

impl AutofixOutcome {
    pub fn ok(&self) -> bool {
        matches!(
            self,
            AutofixOutcome::AlreadyOpened { .. }
                | AutofixOutcome::DryRunComplete
                | AutofixOutcome::PrOpened { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutofixReport {
    pub ok: bool,
    pub run_id: String,
    pub run_dir: PathBuf,
    #[serde(flatten)]
    pub outcome: AutofixOutcome,
    /// Last state reached; `None` when the gate refused.
    pub state: Option<AutofixState>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub changes: Option<ChangeSelection>,
}

/// Why autofix must not proceed for `record`, if anything.
///
/// `force` overrides both refusals.
pub fn gate_reason(record: &RunRecord, force: bool) -> Option<RefusalReason> {
    if force {
        return None;
    }
    let failure = record
        .failure
        .clone()
        .or_else(|| failure_from_stages(&record.stages));
    match failure {
        None => Some(RefusalReason::NoFailure),
        Some(failure) if effective_classification(&failure) == Classification::CredentialOrConfig => {
            Some(RefusalReason::CredentialOrConfig)
        }
        Some(_) => None,
    }
}

/// Tracks the current state and mirrors each transition into the run log.
struct Progress<'a> {
    env: &'a dyn Env,
    log_file: &'a Path,
    redactor: &'a Redactor,
    state: Option<AutofixState>,
}

impl Progress<'_> {
    fn log(&self, message: &str) -> Result<()> {
        append_log(self.env, self.log_file, message, self.redactor)
    }

    fn advance(&mut self, state: AutofixState) -> Result<()> {
        info!(state = state.as_str(), "autofix transition");
        self.state = Some(state);
        self.log(&format!("autofix: {}", state.as_str()))
    }
}

/// Run the autofix pipeline for the run at `run_dir`.
///
/// Refusals, validation failures and empty changes are outcomes, not errors.
/// Unless `keep_worktree` is set, the worktree is removed on every path once
/// it exists, including errors.
#[instrument(skip_all, fields(run_dir = %run_dir.display(), dry_run = opts.dry_run))]
pub fn run_autofix<A: CodingAgent, P: ProbeRunner, H: PrHost>(
    env: &dyn Env,
    run_dir: &Path,
    opts: &AutofixOptions,
    agent: &A,
    probes: &P,
    host: &H,
) -> Result<AutofixReport> {
    let layout = RunLayout::new(run_dir);
    let record = read_run_record(run_dir)?;
    let redactor = Redactor::from_env_names(env, &record.profile.redact_env);
    let mut progress = Progress {
        env,
        log_file: &layout.log_file,
        redactor: &redactor,
        state: None,
    };
    let report = |outcome: AutofixOutcome, state: Option<AutofixState>| AutofixReport {
        ok: outcome.ok(),
        run_id: record.run_id.clone(),
        run_dir: run_dir.to_path_buf(),
        outcome,
        state,
        branch: None,
        commit: None,
        changes: None,
    };

    if let Some(reason) = gate_reason(&record, opts.force) {
        warn!(%reason, "autofix refused");
        progress.log(&format!("autofix refused: {reason}"))?;
        return Ok(report(AutofixOutcome::Refused { reason }, None));
    }
    progress.advance(AutofixState::Gated)?;

    if let Some(url) = existing_pr_url(&layout) {
        info!(%url, "pull request already opened");
        progress.log(&format!("autofix: PR already opened at {url}"))?;
        return Ok(report(
            AutofixOutcome::AlreadyOpened { url },
            progress.state,
        ));
    }

    let agent_bin = agent.resolve_binary(env)?;
    debug!(bin = %agent_bin.display(), "coding agent resolved");

    let (worktree, reused) = ensure_worktree(
        env,
        &layout,
        &record,
        &WorktreeSettings {
            sdk_path: &opts.sdk_path,
            allow_dirty: opts.allow_dirty_sdk,
            keep: opts.keep_worktree,
        },
    )?;
    progress.advance(AutofixState::WorktreeReady)?;

    let mut commit = None;
    let mut changes = None;
    let attempt = (|| -> Result<AutofixOutcome> {
        let capsule = write_capsule(env, &layout, &record, &opts.stages, &redactor)?;

        let previous = if reused {
            load_validation(&layout).filter(|summary| summary.ok)
        } else {
            None
        };
        let validation = match previous {
            Some(summary) => {
                info!("worktree already validated, skipping agent");
                progress.log("autofix: reusing passing validation")?;
                summary
            }
            None => {
                AgentStep {
                    env,
                    layout: &layout,
                    record: &record,
                    worktree: &worktree,
                    capsule: &capsule,
                    redactor: &redactor,
                }
                .run(agent, &agent_bin)?;
                progress.advance(AutofixState::AgentRan)?;
                validate_worktree(
                    env,
                    &layout,
                    worktree.path(),
                    &capsule.repro_script,
                    probes,
                    &redactor,
                )?
            }
        };
        progress.advance(AutofixState::Validated)?;
        if !validation.ok {
            progress.log("autofix: validation failed, nothing committed")?;
            return Ok(AutofixOutcome::ValidationFailed);
        }

        let git = Git::new(worktree.path());
        let selection = select_changes(&git.status_porcelain()?);
        debug!(
            paths = selection.paths.len(),
            skipped = selection.skipped_ephemeral.len(),
            "changes selected"
        );
        changes = Some(selection.clone());
        let title = autofix_title(&record);
        let Some(sha) = commit_selection(&git, &selection, &worktree.base.base_sha, &title)?
        else {
            progress.log("autofix: no changes to commit")?;
            return Ok(AutofixOutcome::NoChanges);
        };
        commit = Some(sha.clone());
        progress.advance(AutofixState::Committed)?;

        let publication = Publication {
            layout: &layout,
            git: &git,
            branch: worktree.branch(),
            commit: &sha,
            title: &title,
            body_path: write_pr_body(&layout, &record, &git, &validation, &redactor)?,
            changes: &selection,
            target: &opts.target,
            redactor: &redactor,
        };
        if opts.dry_run {
            publication.dry_run(&opts.fork)?;
            progress.advance(AutofixState::DryRunComplete)?;
            return Ok(AutofixOutcome::DryRunComplete);
        }
        let head = publication.push(host, &opts.fork)?;
        progress.advance(AutofixState::Pushed)?;
        let pr = publication.open_pr(host, head)?;
        progress.advance(AutofixState::PrOpened)?;
        let url = pr.url.unwrap_or_default();
        progress.log(&format!("autofix: PR opened at {url}"))?;
        Ok(AutofixOutcome::PrOpened { url })
    })();

    if let Err(err) = &attempt
        && let Err(log_err) = progress.log(&format!("autofix failed: {err:#}"))
    {
        warn!(%log_err, "could not record autofix failure");
    }
    finish_worktree(&progress, &layout, &worktree, opts.keep_worktree);

    let outcome = attempt?;
    Ok(AutofixReport {
        branch: Some(worktree.branch().to_string()),
        commit,
        changes,
        ..report(outcome, progress.state)
    })
}

/// How a worktree is created for a run.
pub struct WorktreeSettings<'a> {
    /// Base agent SDK checkout.
    pub sdk_path: &'a Path,
    pub allow_dirty: bool,
    pub keep: bool,
}

/// Reuse a live worktree from an earlier attempt, or create a new one.
///
/// The flag is `true` when an existing worktree was reused.
pub fn ensure_worktree(
    env: &dyn Env,
    layout: &RunLayout,
    record: &RunRecord,
    settings: &WorktreeSettings<'_>,
) -> Result<(WorktreeRecord, bool)> {
    let target = layout.artifact(WORKTREE_DIR);
    let record_path = layout.artifact(WORKTREE_JSON);
    if target.is_dir() {
        match load_worktree_record(&record_path) {
            Ok(existing) if !existing.worktree.cleaned_up => {
                info!(path = %target.display(), "reusing existing worktree");
                return Ok((existing, true));
            }
            Ok(_) => debug!("worktree record marked cleaned up"),
            Err(err) => debug!(%err, "no reusable worktree record"),
        }
    }
    let created = create_worktree(
        env,
        &WorktreeRequest {
            base_path: settings.sdk_path,
            target_path: &target,
            profile_name: &record.profile.name,
            run_id: &record.run_id,
            allow_dirty: settings.allow_dirty,
            keep_worktree: settings.keep,
        },
    )?;
    write_worktree_record(&record_path, &created)?;
    Ok((created, false))
}

/// The worktree left behind by an earlier `--keep-worktree` invocation.
pub fn live_worktree(layout: &RunLayout) -> Result<WorktreeRecord> {
    const HINT: &str = "create one with `oh-llm autofix worktree --keep-worktree`";
    let record = load_worktree_record(&layout.artifact(WORKTREE_JSON))
        .map_err(|err| Error::Config(format!("no worktree for this run ({err:#}); {HINT}")))?;
    if record.worktree.cleaned_up || !record.path().is_dir() {
        return Err(Error::Config(format!(
            "worktree {} was removed; {HINT}",
            record.path().display()
        ))
        .into());
    }
    Ok(record)
}

/// Remove the worktree and its branch, then persist the record as cleaned up.
pub fn remove_worktree(layout: &RunLayout, worktree: &WorktreeRecord) -> Result<WorktreeRecord> {
    cleanup_worktree(&worktree.base.path, worktree.path(), worktree.branch())?;
    let cleaned = mark_cleaned(worktree);
    write_worktree_record(&layout.artifact(WORKTREE_JSON), &cleaned)?;
    Ok(cleaned)
}

/// Remove the worktree unless asked to keep it. Failures are logged only.
fn finish_worktree(
    progress: &Progress<'_>,
    layout: &RunLayout,
    worktree: &WorktreeRecord,
    keep: bool,
) {
    let note = |message: &str| {
        if let Err(err) = progress.log(message) {
            warn!(%err, "could not append to run log");
        }
    };
    if keep {
        info!(path = %worktree.path().display(), "keeping worktree");
        note(&format!("autofix: kept worktree at {}", worktree.path().display()));
        return;
    }
    match remove_worktree(layout, worktree) {
        Ok(_) => note("autofix: worktree cleaned up"),
        Err(err) => {
            warn!(%err, "worktree cleanup failed");
            note(&format!("autofix: worktree cleanup failed: {err:#}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        ProfileDescriptor, StageError, StageKey, StageRecord, StageStatus,
    };

    fn record_with(stage_b: Option<StageError>) -> RunRecord {
        let mut record = RunRecord::new(
            "0123456789ab",
            "2025-01-02T03:04:05+00:00",
            ProfileDescriptor {
                name: "acme".to_string(),
                ..ProfileDescriptor::default()
            },
        );
        let status = if stage_b.is_some() {
            StageStatus::Fail
        } else {
            StageStatus::Pass
        };
        record.set_stage(
            StageKey::B,
            StageRecord {
                status,
                error: stage_b,
                ..StageRecord::not_run(StageKey::B)
            },
        );
        record.sync_failure();
        record
    }

    fn error(message: &str) -> StageError {
        StageError {
            kind: Some("ProviderError".to_string()),
            message: Some(message.to_string()),
            ..StageError::default()
        }
    }

    #[test]
    fn passing_run_is_refused_without_force() {
        let record = record_with(None);
        assert_eq!(gate_reason(&record, false), Some(RefusalReason::NoFailure));
        assert_eq!(gate_reason(&record, true), None);
    }

    #[test]
    fn credential_failure_is_refused_without_force() {
        let record = record_with(Some(error("401 Unauthorized")));
        assert_eq!(
            gate_reason(&record, false),
            Some(RefusalReason::CredentialOrConfig)
        );
        assert_eq!(gate_reason(&record, true), None);
    }

    #[test]
    fn provider_bug_passes_gate() {
        let record = record_with(Some(error("tool_calls field rejected")));
        assert_eq!(gate_reason(&record, false), None);
    }

    #[test]
    fn gate_falls_back_to_stage_state() {
        let mut record = record_with(Some(error("tool_calls field rejected")));
        record.failure = None;
        assert_eq!(gate_reason(&record, false), None);
    }

    #[test]
    fn report_flattens_outcome() {
        let outcome = AutofixOutcome::Refused {
            reason: RefusalReason::NoFailure,
        };
        let value = serde_json::to_value(AutofixReport {
            ok: outcome.ok(),
            run_id: "r".to_string(),
            run_dir: PathBuf::from("/runs/r"),
            outcome,
            state: None,
            branch: None,
            commit: None,
            changes: None,
        })
        .expect("serialize");
        assert_eq!(value["outcome"], "refused");
        assert_eq!(value["reason"], "no_failure");
        assert_eq!(value["ok"], false);
    }
}
