//! Command bodies behind the `oh-llm` binary.
//!
//! Each command returns the process exit code. Errors propagate as
//! `anyhow::Error` and are turned into a redacted payload by [`report_error`].

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::autofix::pr::{ForkTarget, PrTarget};
use crate::autofix::steps::{
    PrStepOptions, RunContext, build_capsule, check_gate, cleanup, prepare_worktree, publish,
    run_agent, run_validation,
};
use crate::autofix::{AutofixOptions, AutofixOutcome, WorktreeSettings, run_autofix};
use crate::core::failure::effective_classification;
use crate::core::redaction::Redactor;
use crate::core::types::{Classification, StageKey};
use crate::env::Env;
use crate::error::Error;
use crate::exit_codes;
use crate::io::agent::OpenHandsCli;
use crate::io::archive::export_run;
use crate::io::config::{
    AppConfig, config_path, expand_home, load_config, resolve_agent_sdk_path, resolve_runs_dir,
};
use crate::io::gh::GhCli;
use crate::io::ledger::{
    RunLayout, latest_run, list_run_dirs, read_run_record, resolve_run, summarize,
};
use crate::io::probe::UvProbeRunner;
use crate::io::profiles::{NewProfile, Profile, ProfileStore, ProfileUpdate};
use crate::io::sdk::{check_import, collect_sdk_info};
use crate::run::{RunOptions, execute_run, redact_env_names};

/// Shared state for one invocation.
pub struct Context<'a> {
    pub env: &'a dyn Env,
    pub config: AppConfig,
    pub json: bool,
    /// Secrets of the run or profile a command is working on, used when
    /// reporting an error that escapes the command.
    error_redactor: RefCell<Redactor>,
}

impl<'a> Context<'a> {
    /// Load the config file selected by `--config`, `OH_LLM_CONFIG`, or the default path.
    pub fn load(env: &'a dyn Env, config_flag: Option<&Path>, json: bool) -> Result<Self> {
        let path = config_path(env, config_flag)?;
        Ok(Self {
            env,
            config: load_config(&path)?,
            json,
            error_redactor: RefCell::new(Redactor::default()),
        })
    }

    /// Redactor for errors escaping the current command.
    pub fn error_redactor(&self) -> Redactor {
        self.error_redactor.borrow().clone()
    }

    fn protect(&self, redactor: Redactor) {
        self.error_redactor.replace(redactor);
    }

    /// Resolve `reference` (or the newest run) and redact its secrets from errors.
    fn select_run(&self, runs_dir: Option<&Path>, reference: Option<&str>) -> Result<PathBuf> {
        let runs_dir = self.runs_dir(runs_dir)?;
        let run_dir = match reference {
            Some(reference) => resolve_run(&runs_dir, reference)?,
            None => latest_run(&runs_dir)?,
        };
        self.protect(run_redactor(self.env, &run_dir));
        Ok(run_dir)
    }

    fn runs_dir(&self, flag: Option<&Path>) -> Result<PathBuf> {
        resolve_runs_dir(self.env, &self.config, flag)
    }

    fn sdk_path(&self, flag: Option<&Path>) -> Result<PathBuf> {
        resolve_agent_sdk_path(self.env, &self.config, flag)
    }

    /// Pretty JSON in `--json` mode, otherwise the human lines.
    fn emit<T: Serialize>(&self, value: &T, redactor: &Redactor, human: &str) -> Result<()> {
        if self.json {
            print!("{}", redactor.to_json(value)?);
        } else {
            println!("{}", redactor.redact_text(human.trim_end()));
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Profile id to test.
    #[arg(long)]
    pub profile: String,
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
    /// Agent SDK checkout the probes run against.
    #[arg(long)]
    pub sdk_path: Option<PathBuf>,
    /// Also run stage B (tool-calling agent loop).
    #[arg(long)]
    pub stage_b: bool,
    /// Synthesize passing results without the SDK or an API key.
    #[arg(long)]
    pub mock: bool,
    /// Advisory timeout for both stages, in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Additional environment variable whose value must be redacted.
    #[arg(long = "redact-env", value_name = "NAME")]
    pub redact_env: Vec<String>,
}

pub fn cmd_run(ctx: &Context<'_>, args: RunArgs) -> Result<i32> {
    let mut stages = ctx.config.stages.clone();
    if let Some(secs) = args.timeout_secs {
        if secs == 0 {
            return Err(Error::InvalidInput("--timeout-secs must be > 0".to_string()).into());
        }
        stages.stage_a_timeout_secs = secs;
        stages.stage_b_timeout_secs = secs;
    }
    let store = ProfileStore::from_env(ctx.env)?;
    if let Ok(profile) = store.get(&args.profile) {
        ctx.protect(Redactor::from_env_names(
            ctx.env,
            &redact_env_names(&profile, &args.redact_env),
        ));
    }
    let opts = RunOptions {
        profile: args.profile,
        runs_dir: ctx.runs_dir(args.runs_dir.as_deref())?,
        sdk_path: ctx.sdk_path(args.sdk_path.as_deref())?,
        stage_b: args.stage_b,
        mock: args.mock,
        redact_env: args.redact_env,
        stages,
    };
    let probes = UvProbeRunner::new(opts.stages.uv_bin.clone());
    let report = execute_run(ctx.env, &store, &opts, &probes)?;

    let redactor = run_redactor(ctx.env, &report.run_dir);
    let mut human = format!(
        "run {}: {}\n  dir: {}\n",
        report.run_id,
        report.status.as_str(),
        report.run_dir.display()
    );
    for (key, status) in &report.stages {
        human.push_str(&format!("  stage {}: {}\n", key.as_str(), status.as_str()));
    }
    if let Some(failure) = &report.failure {
        human.push_str(&format!(
            "  failure: {} at stage {}: {}\n",
            failure.classification.map_or("unknown", Classification::as_str),
            failure.stage.map_or("?", StageKey::as_str),
            failure.message.as_deref().unwrap_or("")
        ));
        if let Some(hint) = &failure.hint {
            human.push_str(&format!("  hint: {hint}\n"));
        }
    }
    ctx.emit(&report, &redactor, &human)?;
    Ok(exit_for(report.ok))
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Create a profile.
    Add {
        id: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        base_url: Option<String>,
        /// Name of the variable holding the API key (never the key itself).
        #[arg(long)]
        api_key_env: String,
        #[arg(long)]
        overwrite: bool,
    },
    Show {
        id: String,
    },
    List,
    /// Change selected fields of a profile.
    Edit {
        id: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, conflicts_with = "clear_base_url")]
        base_url: Option<String>,
        #[arg(long)]
        clear_base_url: bool,
        #[arg(long)]
        api_key_env: Option<String>,
    },
    Delete {
        id: String,
        #[arg(long)]
        missing_ok: bool,
    },
}

pub fn cmd_profile(ctx: &Context<'_>, command: ProfileCommand) -> Result<i32> {
    let store = ProfileStore::from_env(ctx.env)?;
    let redactor = Redactor::default();
    match command {
        ProfileCommand::Add {
            id,
            model,
            base_url,
            api_key_env,
            overwrite,
        } => {
            let profile = store.add(
                ctx.env,
                &NewProfile {
                    profile_id: id,
                    model,
                    base_url,
                    api_key_env,
                },
                overwrite,
            )?;
            ctx.emit(
                &profile,
                &redactor,
                &format!("saved profile {}", profile.profile_id),
            )?;
        }
        ProfileCommand::Show { id } => {
            let profile = store.get(&id)?;
            ctx.emit(&profile, &redactor, &describe_profile(&profile))?;
        }
        ProfileCommand::List => {
            let ids = store.list()?;
            ctx.emit(&json!({"profiles": ids}), &redactor, &ids.join("\n"))?;
        }
        ProfileCommand::Edit {
            id,
            model,
            base_url,
            clear_base_url,
            api_key_env,
        } => {
            let profile = store.update(
                ctx.env,
                &id,
                &ProfileUpdate {
                    model,
                    base_url,
                    clear_base_url,
                    api_key_env,
                },
            )?;
            ctx.emit(&profile, &redactor, &describe_profile(&profile))?;
        }
        ProfileCommand::Delete { id, missing_ok } => {
            let deleted = store.delete(&id, missing_ok)?;
            let human = if deleted {
                format!("deleted profile {id}")
            } else {
                format!("profile {id} not found")
            };
            ctx.emit(
                &json!({"ok": true, "profile_id": id, "deleted": deleted}),
                &redactor,
                &human,
            )?;
        }
    }
    Ok(exit_codes::OK)
}

fn describe_profile(profile: &Profile) -> String {
    format!(
        "{}\n  model: {}\n  base_url: {}\n  api_key_env: {}\n",
        profile.profile_id,
        profile.model,
        profile.base_url.as_deref().unwrap_or("-"),
        profile.api_key_env.as_deref().unwrap_or("-"),
    )
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    /// List runs, newest first.
    List {
        #[arg(long)]
        runs_dir: Option<PathBuf>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one run record.
    Show {
        reference: String,
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },
    /// Pack a run directory into a `.tar.gz`.
    Export {
        reference: String,
        #[arg(long)]
        runs_dir: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

pub fn cmd_runs(ctx: &Context<'_>, command: RunsCommand) -> Result<i32> {
    let redactor = Redactor::default();
    match command {
        RunsCommand::List { runs_dir, limit } => {
            let runs_dir = ctx.runs_dir(runs_dir.as_deref())?;
            let mut summaries = Vec::new();
            for dir in list_run_dirs(&runs_dir)? {
                if limit.is_some_and(|limit| summaries.len() >= limit) {
                    break;
                }
                match summarize(&dir) {
                    Ok(summary) => summaries.push(summary),
                    Err(err) => warn!(dir = %dir.display(), %err, "skipping unreadable run"),
                }
            }
            let human: Vec<String> = summaries
                .iter()
                .map(|summary| {
                    format!(
                        "{}  {:<8} {}  {}",
                        summary.run_id,
                        summary.status.as_str(),
                        summary.profile_name,
                        summary.run_dir.display()
                    )
                })
                .collect();
            ctx.emit(&json!({"runs": summaries}), &redactor, &human.join("\n"))?;
        }
        RunsCommand::Show {
            reference,
            runs_dir,
        } => {
            let run_dir = ctx.select_run(runs_dir.as_deref(), Some(&reference))?;
            let record = read_run_record(&run_dir)?;
            let summary = summarize(&run_dir)?;
            let mut human = format!(
                "run {}: {}\n  dir: {}\n  profile: {}\n  created_at: {}\n",
                summary.run_id,
                summary.status.as_str(),
                run_dir.display(),
                summary.profile_name,
                summary.created_at
            );
            for (key, stage) in &record.stages {
                human.push_str(&format!("  stage {}: {}\n", key.as_str(), stage.status.as_str()));
            }
            if let Some(failure) = &record.failure {
                human.push_str(&format!(
                    "  failure: {} ({})\n",
                    effective_classification(failure).as_str(),
                    failure.message.as_deref().unwrap_or("")
                ));
            }
            ctx.emit(
                &json!({"run_dir": run_dir, "status": summary.status, "record": record}),
                &redactor,
                &human,
            )?;
        }
        RunsCommand::Export {
            reference,
            runs_dir,
            output,
        } => {
            let run_dir = ctx.select_run(runs_dir.as_deref(), Some(&reference))?;
            let output = match output {
                Some(path) => expand_home(ctx.env, &path),
                None => PathBuf::from(format!("{}.tar.gz", RunLayout::new(&run_dir).dir_name())),
            };
            let files = export_run(&run_dir, &output)?;
            ctx.emit(
                &json!({"ok": true, "run_dir": run_dir, "output": output, "files": files}),
                &redactor,
                &format!("exported {} files to {}", files, output.display()),
            )?;
        }
    }
    Ok(exit_codes::OK)
}

/// `oh-llm autofix [REF]` runs the whole pipeline; a step subcommand runs one part.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
pub struct AutofixCommand {
    #[command(subcommand)]
    pub step: Option<AutofixStep>,
    #[command(flatten)]
    pub args: AutofixArgs,
}

#[derive(Debug, Args)]
pub struct AutofixArgs {
    /// Run directory name, run id, or a unique prefix. Defaults to the newest run.
    pub reference: Option<String>,
    /// Same as the positional reference.
    #[arg(long = "run", value_name = "REF", conflicts_with = "reference")]
    pub run: Option<String>,
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
    #[arg(long)]
    pub sdk_path: Option<PathBuf>,
    /// Proceed even when the gate would refuse.
    #[arg(long)]
    pub force: bool,
    /// Commit locally and record the PR plan, without pushing or opening it.
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub keep_worktree: bool,
    #[arg(long)]
    pub allow_dirty_sdk: bool,
    #[arg(long)]
    pub openhands_bin: Option<String>,
    #[arg(long)]
    pub fork_owner: Option<String>,
    #[arg(long)]
    pub fork_url: Option<String>,
    #[arg(long)]
    pub push_remote: Option<String>,
    #[arg(long)]
    pub upstream_repo: Option<String>,
    #[arg(long)]
    pub base: Option<String>,
    #[arg(long)]
    pub draft: bool,
}

/// Which run a single autofix step works on.
#[derive(Debug, Args)]
pub struct RunSelector {
    /// Run directory name, run id, or a unique prefix. Defaults to the newest run.
    #[arg(long = "run", value_name = "REF")]
    pub reference: Option<String>,
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
}

/// Where and how the branch is published.
#[derive(Debug, Args)]
pub struct PublishArgs {
    #[arg(long)]
    pub fork_owner: Option<String>,
    #[arg(long)]
    pub fork_url: Option<String>,
    #[arg(long)]
    pub push_remote: Option<String>,
    #[arg(long)]
    pub upstream_repo: Option<String>,
    #[arg(long)]
    pub base: Option<String>,
    #[arg(long)]
    pub draft: bool,
}

#[derive(Debug, Subcommand)]
pub enum AutofixStep {
    /// Check whether the run may be autofixed.
    Start {
        #[command(flatten)]
        run: RunSelector,
        #[arg(long)]
        force: bool,
    },
    /// Create the run's worktree; removed again unless `--keep-worktree`.
    Worktree {
        #[command(flatten)]
        run: RunSelector,
        #[arg(long)]
        sdk_path: Option<PathBuf>,
        #[arg(long)]
        keep_worktree: bool,
        #[arg(long)]
        allow_dirty_sdk: bool,
        #[arg(long)]
        force: bool,
    },
    /// Write the context capsule and repro script.
    Capsule {
        #[command(flatten)]
        run: RunSelector,
    },
    /// Run the coding agent in the kept worktree.
    Agent {
        #[command(flatten)]
        run: RunSelector,
        #[arg(long)]
        openhands_bin: Option<String>,
    },
    /// Re-run both stages inside the kept worktree.
    Validate {
        #[command(flatten)]
        run: RunSelector,
    },
    /// Commit the kept worktree and open (or dry-run) the upstream PR.
    Pr {
        #[command(flatten)]
        run: RunSelector,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        publish: PublishArgs,
    },
    /// Remove the kept worktree and its branch.
    Cleanup {
        #[command(flatten)]
        run: RunSelector,
    },
}

impl Context<'_> {
    fn fork_target(&self, args: &PublishArgs) -> (ForkTarget, PrTarget) {
        let defaults = &self.config.autofix;
        (
            ForkTarget {
                owner: args.fork_owner.clone(),
                url: args.fork_url.clone(),
                remote: args
                    .push_remote
                    .clone()
                    .unwrap_or_else(|| defaults.push_remote.clone()),
            },
            PrTarget {
                upstream_repo: args
                    .upstream_repo
                    .clone()
                    .unwrap_or_else(|| defaults.upstream_repo.clone()),
                base: args.base.clone().unwrap_or_else(|| defaults.base.clone()),
                draft: args.draft || defaults.draft,
            },
        )
    }
}

pub fn cmd_autofix(ctx: &Context<'_>, command: AutofixCommand) -> Result<i32> {
    match command.step {
        Some(step) => cmd_autofix_step(ctx, step),
        None => cmd_autofix_all(ctx, command.args),
    }
}

fn cmd_autofix_all(ctx: &Context<'_>, args: AutofixArgs) -> Result<i32> {
    let reference = args.reference.as_deref().or(args.run.as_deref());
    let run_dir = ctx.select_run(args.runs_dir.as_deref(), reference)?;
    let defaults = &ctx.config.autofix;
    let (fork, target) = ctx.fork_target(&PublishArgs {
        fork_owner: args.fork_owner,
        fork_url: args.fork_url,
        push_remote: args.push_remote,
        upstream_repo: args.upstream_repo,
        base: args.base,
        draft: args.draft,
    });
    let opts = AutofixOptions {
        sdk_path: ctx.sdk_path(args.sdk_path.as_deref())?,
        force: args.force,
        dry_run: args.dry_run,
        keep_worktree: args.keep_worktree,
        allow_dirty_sdk: args.allow_dirty_sdk,
        fork,
        target,
        stages: ctx.config.stages.clone(),
    };
    let agent = OpenHandsCli::new(
        args.openhands_bin
            .unwrap_or_else(|| defaults.openhands_bin.clone()),
    );
    let probes = UvProbeRunner::new(opts.stages.uv_bin.clone());
    let host = GhCli::new(defaults.gh_bin.clone());

    let report = run_autofix(ctx.env, &run_dir, &opts, &agent, &probes, &host)?;
    let human = match &report.outcome {
        AutofixOutcome::Refused { reason } => format!(
            "autofix refused for run {}: {reason} (use --force to override)",
            report.run_id
        ),
        AutofixOutcome::AlreadyOpened { url } => format!("PR already opened: {url}"),
        AutofixOutcome::ValidationFailed => {
            format!("validation failed; see {}", run_dir.join("artifacts").display())
        }
        AutofixOutcome::NoChanges => "agent produced no changes".to_string(),
        AutofixOutcome::DryRunComplete => format!(
            "dry run complete on branch {}; see {}",
            report.branch.as_deref().unwrap_or("-"),
            run_dir.join("artifacts").display()
        ),
        AutofixOutcome::PrOpened { url } => format!("PR opened: {url}"),
    };
    ctx.emit(&report, &run_redactor(ctx.env, &run_dir), &human)?;
    Ok(exit_for(report.ok))
}

fn cmd_autofix_step(ctx: &Context<'_>, step: AutofixStep) -> Result<i32> {
    let selector = match &step {
        AutofixStep::Start { run, .. }
        | AutofixStep::Worktree { run, .. }
        | AutofixStep::Capsule { run }
        | AutofixStep::Agent { run, .. }
        | AutofixStep::Validate { run }
        | AutofixStep::Pr { run, .. }
        | AutofixStep::Cleanup { run } => run,
    };
    let run_dir = ctx.select_run(selector.runs_dir.as_deref(), selector.reference.as_deref())?;
    let run = RunContext::load(ctx.env, &run_dir)?;
    let stages = &ctx.config.stages;
    let defaults = &ctx.config.autofix;
    match step {
        AutofixStep::Start { force, .. } => {
            let report = check_gate(&run, force)?;
            let human = match report.reason {
                Some(reason) => format!(
                    "autofix refused for run {}: {reason} (use --force to override)",
                    report.run_id
                ),
                None => format!("run {} may be autofixed", report.run_id),
            };
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
        AutofixStep::Worktree {
            sdk_path,
            keep_worktree,
            allow_dirty_sdk,
            force,
            ..
        } => {
            let sdk_path = ctx.sdk_path(sdk_path.as_deref())?;
            let report = prepare_worktree(
                &run,
                &WorktreeSettings {
                    sdk_path: &sdk_path,
                    allow_dirty: allow_dirty_sdk,
                    keep: keep_worktree,
                },
                force,
            )?;
            let human = if keep_worktree {
                format!(
                    "worktree ready at {} on branch {}",
                    report.worktree.path().display(),
                    report.worktree.branch()
                )
            } else {
                format!(
                    "worktree created and removed (branch {}); use --keep-worktree to keep it",
                    report.worktree.branch()
                )
            };
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
        AutofixStep::Capsule { .. } => {
            let report = build_capsule(&run, stages)?;
            let human = format!(
                "capsule written to {}",
                report.artifacts.capsule_md.display()
            );
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
        AutofixStep::Agent { openhands_bin, .. } => {
            let agent =
                OpenHandsCli::new(openhands_bin.unwrap_or_else(|| defaults.openhands_bin.clone()));
            let report = run_agent(&run, &agent, stages)?;
            let human = format!(
                "agent exited with {}; transcript at {}",
                report
                    .exit_code
                    .map_or_else(|| "signal".to_string(), |code| code.to_string()),
                report.artifacts.transcript_log.display()
            );
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
        AutofixStep::Validate { .. } => {
            let probes = UvProbeRunner::new(stages.uv_bin.clone());
            let report = run_validation(&run, &probes, stages)?;
            let human = format!(
                "validation {}; see {}",
                if report.ok { "passed" } else { "failed" },
                report.artifacts.summary_md.display()
            );
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
        AutofixStep::Pr {
            dry_run, publish: args, ..
        } => {
            let (fork, target) = ctx.fork_target(&args);
            let host = GhCli::new(defaults.gh_bin.clone());
            let report = publish(
                &run,
                &host,
                &PrStepOptions {
                    dry_run,
                    fork: &fork,
                    target: &target,
                },
            )?;
            let human = match &report.outcome {
                AutofixOutcome::AlreadyOpened { url } => format!("PR already opened: {url}"),
                AutofixOutcome::PrOpened { url } => format!("PR opened: {url}"),
                AutofixOutcome::DryRunComplete => format!(
                    "dry run complete on branch {}",
                    report.branch.as_deref().unwrap_or("-")
                ),
                _ => "no changes to publish".to_string(),
            };
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
        AutofixStep::Cleanup { .. } => {
            let report = cleanup(&run)?;
            let human = format!("removed worktree {}", report.worktree.path().display());
            ctx.emit(&report, &run.redactor, &human)?;
            Ok(exit_for(report.ok))
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum SdkCommand {
    /// One-line health check.
    Status {
        #[arg(long)]
        sdk_path: Option<PathBuf>,
    },
    /// Path, git state and `uv` availability.
    Info {
        #[arg(long)]
        sdk_path: Option<PathBuf>,
    },
    /// Import the SDK package through `uv run` in the checkout.
    CheckImport {
        #[arg(long)]
        sdk_path: Option<PathBuf>,
    },
}

pub fn cmd_sdk(ctx: &Context<'_>, command: SdkCommand) -> Result<i32> {
    let redactor = Redactor::default();
    match command {
        SdkCommand::Status { sdk_path } => {
            let info = collect_sdk_info(
                ctx.env,
                &ctx.sdk_path(sdk_path.as_deref())?,
                &ctx.config.stages.uv_bin,
            );
            let problems = info.problems();
            let human = if problems.is_empty() {
                format!(
                    "ok: {} @ {}",
                    info.path.display(),
                    info.git_sha.as_deref().unwrap_or("unknown")
                )
            } else {
                format!("not ready: {}", problems.join("; "))
            };
            ctx.emit(
                &json!({"ok": problems.is_empty(), "path": info.path, "problems": problems}),
                &redactor,
                &human,
            )?;
            Ok(exit_for(problems.is_empty()))
        }
        SdkCommand::Info { sdk_path } => {
            let info = collect_sdk_info(
                ctx.env,
                &ctx.sdk_path(sdk_path.as_deref())?,
                &ctx.config.stages.uv_bin,
            );
            let human = format!(
                "path: {}\nexists: {}\ngit_sha: {}\ngit_dirty: {}\nuv_available: {}",
                info.path.display(),
                info.exists,
                info.git_sha.as_deref().unwrap_or("-"),
                info.git_dirty
                    .map_or_else(|| "-".to_string(), |dirty| dirty.to_string()),
                info.uv_available
            );
            ctx.emit(&info, &redactor, &human)?;
            Ok(exit_codes::OK)
        }
        SdkCommand::CheckImport { sdk_path } => {
            let check = check_import(
                ctx.env,
                &ctx.sdk_path(sdk_path.as_deref())?,
                &ctx.config.stages.uv_bin,
            )?;
            let human = match &check.module_file {
                Some(file) if check.ok => format!("ok: openhands.sdk from {file}"),
                _ => format!(
                    "import failed (exit {}):\n{}",
                    check
                        .exit_code
                        .map_or_else(|| "-".to_string(), |code| code.to_string()),
                    check.stderr.trim_end()
                ),
            };
            ctx.emit(&check, &redactor, &human)?;
            Ok(exit_for(check.ok))
        }
    }
}

fn exit_for(ok: bool) -> i32 {
    if ok {
        exit_codes::OK
    } else {
        exit_codes::RUN_FAILED
    }
}

/// Redactor for a run's secrets, falling back to the heuristics alone.
fn run_redactor(env: &dyn Env, run_dir: &Path) -> Redactor {
    match read_run_record(run_dir) {
        Ok(record) => Redactor::from_env_names(env, &record.profile.redact_env),
        Err(err) => {
            warn!(%err, "run record unreadable, redacting with heuristics only");
            Redactor::default()
        }
    }
}

/// Exit code for an error that escaped a command.
///
/// Typed domain errors are user-facing (2); everything else is internal (1).
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match domain_error(err) {
        Some(Error::ExternalProcess { .. }) | None => exit_codes::INTERNAL,
        Some(_) => exit_codes::RUN_FAILED,
    }
}

fn domain_error(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

/// Print `err` (redacted) and return the exit code.
pub fn report_error(err: &anyhow::Error, json: bool, redactor: &Redactor) -> i32 {
    let code = domain_error(err).map_or("internal_error", Error::code);
    let message = format!("{err:#}");
    if json {
        let payload = json!({"ok": false, "error": code, "message": message});
        match redactor.to_json(&payload) {
            Ok(text) => print!("{text}"),
            Err(_) => println!(r#"{{"ok": false, "error": "{code}"}}"#),
        }
    } else {
        eprintln!("error: {}", redactor.redact_text(&message));
    }
    exit_code_for(err)
}
