//! Single autofix steps, for driving or resuming an attempt by hand.
//!
//! Every step reloads the run and its artifacts from disk, so steps can run in
//! separate invocations. `worktree` removes the worktree again unless asked to
//! keep it; `agent`, `validate` and `pr` work on a kept worktree and leave it in
//! place until `cleanup`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::autofix::capsule::{CapsuleArtifacts, write_capsule};
use crate::autofix::invoke::{AGENT_RUN_JSON, AgentStep, CONTEXT_MD, TRANSCRIPT_LOG, WORKTREE_PATCH};
use crate::autofix::pr::{
    ForkTarget, PR_BODY_MD, PR_DRY_RUN_JSON, PR_JSON, PrTarget, Publication, autofix_title,
    commit_selection, existing_pr_url, write_pr_body,
};
use crate::autofix::validate::{
    VALIDATION_JSON, VALIDATION_MD, ValidationSummary, load_validation, stage_artifact,
    validate_worktree,
};
use crate::autofix::{
    AutofixOutcome, RefusalReason, WorktreeSettings, ensure_worktree, gate_reason, live_worktree,
    remove_worktree,
};
use crate::core::changes::{ChangeSelection, select_changes};
use crate::core::failure::failure_from_stages;
use crate::core::redaction::Redactor;
use crate::core::types::{Failure, RunRecord};
use crate::env::Env;
use crate::error::Error;
use crate::io::agent::CodingAgent;
use crate::io::config::StageConfig;
use crate::io::gh::PrHost;
use crate::io::git::Git;
use crate::io::ledger::{RunLayout, append_log, read_run_record};
use crate::io::probe::{ProbeRunner, ProbeStage};
use crate::io::worktree::WorktreeRecord;

/// A loaded run plus the redactor for its secrets.
pub struct RunContext<'a> {
    pub env: &'a dyn Env,
    pub layout: RunLayout,
    pub record: RunRecord,
    pub redactor: Redactor,
}

impl<'a> RunContext<'a> {
    pub fn load(env: &'a dyn Env, run_dir: &Path) -> Result<Self> {
        let record = read_run_record(run_dir)?;
        let redactor = Redactor::from_env_names(env, &record.profile.redact_env);
        Ok(Self {
            env,
            layout: RunLayout::new(run_dir),
            record,
            redactor,
        })
    }

    fn log(&self, message: &str) -> Result<()> {
        append_log(self.env, &self.layout.log_file, message, &self.redactor)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub ok: bool,
    pub run_id: String,
    pub failure: Option<Failure>,
    pub reason: Option<RefusalReason>,
}

/// Decide whether the run may be autofixed, without touching the checkout.
pub fn check_gate(run: &RunContext<'_>, force: bool) -> Result<GateReport> {
    let reason = gate_reason(&run.record, force);
    match reason {
        Some(reason) => run.log(&format!("autofix refused: {reason}"))?,
        None => run.log("autofix: gated")?,
    }
    Ok(GateReport {
        ok: reason.is_none(),
        run_id: run.record.run_id.clone(),
        failure: run
            .record
            .failure
            .clone()
            .or_else(|| failure_from_stages(&run.record.stages)),
        reason,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeReport {
    pub ok: bool,
    pub worktree: WorktreeRecord,
}

/// Create or reuse the run's worktree. Unless `settings.keep`, it is removed
/// again before returning, which checks that creation and cleanup both work.
#[instrument(skip_all, fields(run_id = %run.record.run_id, keep = settings.keep))]
pub fn prepare_worktree(
    run: &RunContext<'_>,
    settings: &WorktreeSettings<'_>,
    force: bool,
) -> Result<WorktreeReport> {
    if let Some(reason) = gate_reason(&run.record, force) {
        run.log(&format!("autofix refused: {reason}"))?;
        return Err(Error::InvalidInput(format!(
            "refusing to prepare a worktree: {reason} (use --force to override)"
        ))
        .into());
    }
    let (worktree, reused) = ensure_worktree(run.env, &run.layout, &run.record, settings)?;
    run.log(&format!(
        "autofix: worktree_ready at {} (reused={reused})",
        worktree.path().display()
    ))?;
    if settings.keep {
        return Ok(WorktreeReport { ok: true, worktree });
    }
    let cleaned = remove_worktree(&run.layout, &worktree)?;
    run.log("autofix: worktree cleaned up")?;
    Ok(WorktreeReport {
        ok: true,
        worktree: cleaned,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CapsuleReport {
    pub ok: bool,
    pub artifacts: CapsuleArtifacts,
}

pub fn build_capsule(run: &RunContext<'_>, stages: &StageConfig) -> Result<CapsuleReport> {
    let artifacts = write_capsule(run.env, &run.layout, &run.record, stages, &run.redactor)?;
    run.log("autofix: capsule written")?;
    Ok(CapsuleReport {
        ok: true,
        artifacts,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentArtifacts {
    pub context_md: PathBuf,
    pub transcript_log: PathBuf,
    pub diff_patch: PathBuf,
    pub run_json: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    /// The agent ran; its own exit code is reported separately and not judged.
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub artifacts: AgentArtifacts,
}

/// Run the coding agent in the kept worktree.
#[instrument(skip_all, fields(run_id = %run.record.run_id))]
pub fn run_agent<A: CodingAgent>(
    run: &RunContext<'_>,
    agent: &A,
    stages: &StageConfig,
) -> Result<AgentReport> {
    let bin = agent.resolve_binary(run.env)?;
    let worktree = live_worktree(&run.layout)?;
    let capsule = write_capsule(run.env, &run.layout, &run.record, stages, &run.redactor)?;
    let agent_run = AgentStep {
        env: run.env,
        layout: &run.layout,
        record: &run.record,
        worktree: &worktree,
        capsule: &capsule,
        redactor: &run.redactor,
    }
    .run(agent, &bin)?;
    run.log("autofix: agent_ran")?;
    Ok(AgentReport {
        ok: true,
        exit_code: agent_run.exit_code,
        artifacts: AgentArtifacts {
            context_md: run.layout.artifact(CONTEXT_MD),
            transcript_log: run.layout.artifact(TRANSCRIPT_LOG),
            diff_patch: run.layout.artifact(WORKTREE_PATCH),
            run_json: run.layout.artifact(AGENT_RUN_JSON),
        },
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationArtifacts {
    pub stage_a: PathBuf,
    pub stage_b: PathBuf,
    pub summary_json: PathBuf,
    pub summary_md: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub validation: ValidationSummary,
    pub artifacts: ValidationArtifacts,
}

/// Re-run both stages inside the kept worktree.
#[instrument(skip_all, fields(run_id = %run.record.run_id))]
pub fn run_validation<P: ProbeRunner>(
    run: &RunContext<'_>,
    probes: &P,
    stages: &StageConfig,
) -> Result<ValidationReport> {
    let worktree = live_worktree(&run.layout)?;
    let capsule = write_capsule(run.env, &run.layout, &run.record, stages, &run.redactor)?;
    let validation = validate_worktree(
        run.env,
        &run.layout,
        worktree.path(),
        &capsule.repro_script,
        probes,
        &run.redactor,
    )?;
    run.log(&format!("autofix: validated (ok={})", validation.ok))?;
    Ok(ValidationReport {
        ok: validation.ok,
        validation,
        artifacts: ValidationArtifacts {
            stage_a: run.layout.artifact(&stage_artifact(ProbeStage::A)),
            stage_b: run.layout.artifact(&stage_artifact(ProbeStage::B)),
            summary_json: run.layout.artifact(VALIDATION_JSON),
            summary_md: run.layout.artifact(VALIDATION_MD),
        },
    })
}

pub struct PrStepOptions<'a> {
    pub dry_run: bool,
    pub fork: &'a ForkTarget,
    pub target: &'a PrTarget,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrArtifacts {
    pub pr_record_json: Option<PathBuf>,
    pub pr_body_md: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrReport {
    pub ok: bool,
    #[serde(flatten)]
    pub outcome: AutofixOutcome,
    pub dry_run: bool,
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub changes: Option<ChangeSelection>,
    pub artifacts: PrArtifacts,
}

impl PrReport {
    fn new(outcome: AutofixOutcome, dry_run: bool) -> Self {
        let pr_url = match &outcome {
            AutofixOutcome::AlreadyOpened { url } | AutofixOutcome::PrOpened { url } => {
                Some(url.clone())
            }
            _ => None,
        };
        Self {
            ok: outcome.ok(),
            outcome,
            dry_run,
            pr_url,
            branch: None,
            commit: None,
            changes: None,
            artifacts: PrArtifacts::default(),
        }
    }
}

/// Commit the kept worktree's changes and publish them.
///
/// Requires a passing validation summary. An already opened PR is reported
/// without calling the host again.
#[instrument(skip_all, fields(run_id = %run.record.run_id, dry_run = opts.dry_run))]
pub fn publish<H: PrHost>(
    run: &RunContext<'_>,
    host: &H,
    opts: &PrStepOptions<'_>,
) -> Result<PrReport> {
    if let Some(url) = existing_pr_url(&run.layout) {
        info!(%url, "pull request already opened");
        run.log(&format!("autofix: PR already opened at {url}"))?;
        let mut report = PrReport::new(AutofixOutcome::AlreadyOpened { url }, opts.dry_run);
        report.artifacts.pr_record_json = Some(run.layout.artifact(PR_JSON));
        return Ok(report);
    }
    let validation = load_validation(&run.layout).ok_or_else(|| {
        Error::MissingValidation(
            "no autofix validation recorded for this run; run `oh-llm autofix validate` first"
                .to_string(),
        )
    })?;
    if !validation.ok {
        return Err(Error::MissingValidation(
            "the last autofix validation did not pass".to_string(),
        )
        .into());
    }
    let worktree = live_worktree(&run.layout)?;
    let git = Git::new(worktree.path());
    let selection = select_changes(&git.status_porcelain()?);
    let title = autofix_title(&run.record);
    let Some(sha) = commit_selection(&git, &selection, &worktree.base.base_sha, &title)? else {
        warn!("nothing to publish");
        run.log("autofix: no changes to commit")?;
        let mut report = PrReport::new(AutofixOutcome::NoChanges, opts.dry_run);
        report.changes = Some(selection);
        return Ok(report);
    };
    run.log(&format!("autofix: committed {sha}"))?;

    let publication = Publication {
        layout: &run.layout,
        git: &git,
        branch: worktree.branch(),
        commit: &sha,
        title: &title,
        body_path: write_pr_body(&run.layout, &run.record, &git, &validation, &run.redactor)?,
        changes: &selection,
        target: opts.target,
        redactor: &run.redactor,
    };
    let (outcome, record_name) = if opts.dry_run {
        publication.dry_run(opts.fork)?;
        run.log("autofix: dry_run_complete")?;
        (AutofixOutcome::DryRunComplete, PR_DRY_RUN_JSON)
    } else {
        let head = publication.push(host, opts.fork)?;
        run.log("autofix: pushed")?;
        let pr = publication.open_pr(host, head)?;
        let url = pr.url.unwrap_or_default();
        run.log(&format!("autofix: PR opened at {url}"))?;
        (AutofixOutcome::PrOpened { url }, PR_JSON)
    };
    let mut report = PrReport::new(outcome, opts.dry_run);
    report.branch = Some(worktree.branch().to_string());
    report.commit = Some(sha);
    report.artifacts = PrArtifacts {
        pr_record_json: Some(run.layout.artifact(record_name)),
        pr_body_md: Some(run.layout.artifact(PR_BODY_MD)),
    };
    report.changes = Some(selection);
    Ok(report)
}

/// Remove a kept worktree and its branch.
pub fn cleanup(run: &RunContext<'_>) -> Result<WorktreeReport> {
    let worktree = live_worktree(&run.layout)?;
    let cleaned = remove_worktree(&run.layout, &worktree)?;
    run.log("autofix: worktree cleaned up")?;
    Ok(WorktreeReport {
        ok: true,
        worktree: cleaned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autofix::{WORKTREE_DIR, WORKTREE_JSON};
    use crate::core::types::{
        ProfileDescriptor, ResolvedProfile, StageError, StageKey, StageRecord, StageStatus,
    };
    use crate::io::ledger::{create_run, write_run_record};
    use crate::io::worktree::load_worktree_record;
    use crate::test_support::{
        FixedEnv, RecordingPrHost, ScriptedAgent, ScriptedProbes, TestRepo, probe_output,
    };
    use serde_json::json;
    use std::fs;

    const SECRET: &str = "step-canary-7d1a";

    struct Fixture {
        _runs: tempfile::TempDir,
        sdk: TestRepo,
        env: FixedEnv,
        run_dir: PathBuf,
    }

    fn fixture(message: &str) -> Fixture {
        let runs = tempfile::tempdir().expect("runs");
        let sdk = TestRepo::new().expect("sdk");
        let env = FixedEnv::new().with_var("ACME_API_KEY", SECRET);
        let run = create_run(&env, runs.path(), "acme").expect("run");
        let mut record = RunRecord::new(
            &run.run_id,
            &run.created_at,
            ProfileDescriptor {
                name: "acme".to_string(),
                redact_env: vec!["ACME_API_KEY".to_string()],
                resolved: Some(ResolvedProfile {
                    model: "acme/model-1".to_string(),
                    base_url: None,
                    api_key_env: Some("ACME_API_KEY".to_string()),
                }),
            },
        );
        record.set_stage(
            StageKey::B,
            StageRecord {
                status: StageStatus::Fail,
                error: Some(StageError {
                    kind: Some("BadRequestError".to_string()),
                    message: Some(message.to_string()),
                    ..StageError::default()
                }),
                ..StageRecord::not_run(StageKey::B)
            },
        );
        write_run_record(&run.layout.run_json, &mut record, &Redactor::default()).expect("write");
        Fixture {
            _runs: runs,
            sdk,
            env,
            run_dir: run.layout.run_dir,
        }
    }

    impl Fixture {
        fn context(&self) -> RunContext<'_> {
            RunContext::load(&self.env, &self.run_dir).expect("load")
        }

        fn settings(&self, keep: bool) -> WorktreeSettings<'_> {
            WorktreeSettings {
                sdk_path: self.sdk.path(),
                allow_dirty: false,
                keep,
            }
        }
    }

    fn target() -> PrTarget {
        PrTarget {
            upstream_repo: "OpenHands/software-agent-sdk".to_string(),
            base: "main".to_string(),
            draft: false,
        }
    }

    #[test]
    fn gate_reports_credential_refusal() {
        let fx = fixture("401 Unauthorized");
        let report = check_gate(&fx.context(), false).expect("gate");
        assert!(!report.ok);
        assert_eq!(report.reason, Some(RefusalReason::CredentialOrConfig));
        assert_eq!(
            report.failure.and_then(|failure| failure.stage),
            Some(StageKey::B)
        );
        assert!(check_gate(&fx.context(), true).expect("forced").ok);
    }

    #[test]
    fn worktree_step_cleans_up_unless_kept() {
        let fx = fixture("tool_calls rejected");
        let run = fx.context();

        let report = prepare_worktree(&run, &fx.settings(false), false).expect("worktree");
        assert!(report.worktree.worktree.cleaned_up);
        assert!(!report.worktree.path().exists());
        assert!(!fx.sdk.branch_exists(report.worktree.branch()).expect("branch"));

        let kept = prepare_worktree(&run, &fx.settings(true), false).expect("kept");
        assert!(kept.worktree.path().is_dir());
        assert_eq!(live_worktree(&run.layout).expect("live").path(), kept.worktree.path());

        let cleaned = cleanup(&run).expect("cleanup");
        assert!(cleaned.worktree.worktree.cleaned_up);
        assert!(!run.layout.artifact(WORKTREE_DIR).exists());
        assert!(live_worktree(&run.layout).is_err());
    }

    #[test]
    fn worktree_step_honors_the_gate() {
        let fx = fixture("invalid api key");
        let err = prepare_worktree(&fx.context(), &fx.settings(true), false).expect_err("gated");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidInput(_))));
        assert!(!RunLayout::new(&fx.run_dir).artifact(WORKTREE_DIR).exists());
    }

    #[test]
    fn steps_after_worktree_require_a_kept_worktree() {
        let fx = fixture("tool_calls rejected");
        let run = fx.context();
        let err = run_validation(&run, &ScriptedProbes::passing(), &StageConfig::default())
            .expect_err("no worktree");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
        let err = run_agent(&run, &ScriptedAgent::new(&[]), &StageConfig::default())
            .expect_err("no worktree");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn agent_validate_and_dry_run_pr_in_separate_steps() {
        let fx = fixture("tool_calls rejected");
        let run = fx.context();
        prepare_worktree(&run, &fx.settings(true), false).expect("worktree");

        let agent = ScriptedAgent::new(&[("openhands/sdk/llm/fix.py", "FIXED = True\n")])
            .with_transcript(&[&format!("using key {SECRET}")]);
        let agent_report = run_agent(&run, &agent, &StageConfig::default()).expect("agent");
        assert_eq!(agent.calls(), 1);
        let transcript =
            fs::read_to_string(&agent_report.artifacts.transcript_log).expect("transcript");
        assert!(!transcript.contains(SECRET));

        let probes = ScriptedProbes::new(
            probe_output(0, json!({"ok": true, "stage": "a", "response_preview": SECRET})),
            probe_output(0, json!({"ok": true, "stage": "b"})),
        );
        let validation = run_validation(&run, &probes, &StageConfig::default()).expect("validate");
        assert!(validation.ok);
        let stage_a = fs::read_to_string(&validation.artifacts.stage_a).expect("stage a");
        assert!(!stage_a.contains(SECRET));

        let host = RecordingPrHost::new("https://example.test/pull/1", "octo");
        let fork = ForkTarget {
            owner: Some("octo".to_string()),
            url: None,
            remote: "oh-llm-fork".to_string(),
        };
        let target = target();
        let report = publish(
            &run,
            &host,
            &PrStepOptions {
                dry_run: true,
                fork: &fork,
                target: &target,
            },
        )
        .expect("pr");
        assert!(report.ok);
        assert_eq!(report.outcome, AutofixOutcome::DryRunComplete);
        assert_eq!(report.pr_url, None);
        assert!(host.requests().is_empty());
        assert_eq!(
            report.artifacts.pr_record_json,
            Some(run.layout.artifact(PR_DRY_RUN_JSON))
        );
        assert_eq!(
            report.changes.map(|changes| changes.paths),
            Some(vec!["openhands/sdk/llm/fix.py".to_string()])
        );
        // The worktree stays until an explicit cleanup.
        let record = load_worktree_record(&run.layout.artifact(WORKTREE_JSON)).expect("record");
        assert!(!record.worktree.cleaned_up);
    }

    #[test]
    fn pr_step_requires_passing_validation() {
        let fx = fixture("tool_calls rejected");
        let run = fx.context();
        let host = RecordingPrHost::new("https://example.test/pull/1", "octo");
        let fork = ForkTarget::default();
        let target = target();
        let opts = PrStepOptions {
            dry_run: true,
            fork: &fork,
            target: &target,
        };

        let err = publish(&run, &host, &opts).expect_err("no validation");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingValidation(_))
        ));

        fs::write(
            run.layout.artifact(PR_JSON),
            r#"{"url": "https://example.test/pull/9"}"#,
        )
        .expect("pr record");
        let report = publish(&run, &host, &opts).expect("already opened");
        assert_eq!(report.pr_url.as_deref(), Some("https://example.test/pull/9"));
        assert!(host.requests().is_empty());
    }
}
