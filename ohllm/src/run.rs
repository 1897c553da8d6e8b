//! Orchestration for `oh-llm run`.
//!
//! Creates a run directory, then executes stage A (and stage B when asked and
//! A passed), persisting `run.json` after every stage so an interrupted run
//! still leaves an accurate record behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::redaction::Redactor;
use crate::core::summary::{RunStatus, compute_status};
use crate::core::types::{
    Classification, Failure, ProfileDescriptor, ResolvedProfile, RunRecord, RunRequest, StageError,
    StageKey, StageStatus,
};
use crate::env::Env;
use crate::io::artifacts::write_json_redacted;
use crate::io::config::StageConfig;
use crate::io::ledger::{RunLayout, append_log, create_run, write_run_record};
use crate::io::probe::{
    ProbeConfig, ProbeRequest, ProbeRunner, ProbeStage, ProbeVerdict, interpret_probe,
    launch_failure, stage_prompt, write_harness,
};
use crate::io::process::CommandResult;
use crate::io::profiles::{Profile, ProfileStore};
use crate::io::sdk::{AgentSdkInfo, collect_sdk_info};

/// Directory handed to the stage B agent as its workspace.
pub const STAGE_B_WORKSPACE: &str = "stage_b_workspace";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub profile: String,
    pub runs_dir: PathBuf,
    pub sdk_path: PathBuf,
    pub stage_b: bool,
    /// Synthesize passing stages without the key or the runtime checkout.
    pub mock: bool,
    pub stages: StageConfig,
    /// Extra variables whose values must never reach an artifact.
    pub redact_env: Vec<String>,
}

/// Outcome of `run`, printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Every executed stage passed.
    pub ok: bool,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub stages: BTreeMap<StageKey, StageStatus>,
    pub failure: Option<Failure>,
}

/// Execute the compatibility stages for `opts.profile`.
#[instrument(skip_all, fields(profile = %opts.profile, mock = opts.mock))]
pub fn execute_run<P: ProbeRunner>(
    env: &dyn Env,
    store: &ProfileStore,
    opts: &RunOptions,
    probes: &P,
) -> Result<RunReport> {
    let profile = store.get(&opts.profile)?;
    let redact_env = redact_env_names(&profile, &opts.redact_env);
    let redactor = Redactor::from_env_names(env, &redact_env);
    let sdk = collect_sdk_info(env, &opts.sdk_path, &opts.stages.uv_bin);

    let run = create_run(env, &opts.runs_dir, &profile.profile_id)?;
    let layout = run.layout;
    let mut record = RunRecord::new(
        &run.run_id,
        &run.created_at,
        ProfileDescriptor {
            name: profile.profile_id.clone(),
            redact_env,
            resolved: Some(profile.resolved()),
        },
    );
    record.requested = Some(RunRequest {
        stage_b: opts.stage_b,
        mock: opts.mock,
        stage_a_timeout_secs: opts.stages.stage_a_timeout_secs,
        stage_b_timeout_secs: opts.stages.stage_b_timeout_secs,
    });
    record.agent_sdk = Some(sdk.snapshot());
    write_run_record(&layout.run_json, &mut record, &redactor)?;
    log(
        env,
        &layout,
        &format!(
            "run {} created for profile {} (model {}, mock={})",
            run.run_id, profile.profile_id, profile.model, opts.mock
        ),
        &redactor,
    )?;

    let ctx = StageContext {
        env,
        layout: &layout,
        profile: &profile,
        sdk: &sdk,
        opts,
        redactor: &redactor,
    };

    let stage_a = ctx.run_stage(ProbeStage::A, probes)?;
    let a_passed = stage_a.passed();
    record.set_stage(StageKey::A, stage_a.into_stage_record(StageKey::A));
    write_run_record(&layout.run_json, &mut record, &redactor)?;

    if opts.stage_b && a_passed {
        let stage_b = ctx.run_stage(ProbeStage::B, probes)?;
        record.set_stage(StageKey::B, stage_b.into_stage_record(StageKey::B));
        write_run_record(&layout.run_json, &mut record, &redactor)?;
    } else if opts.stage_b {
        log(env, &layout, "stage B skipped: stage A did not pass", &redactor)?;
    }

    let stages: BTreeMap<StageKey, StageStatus> = record
        .stages
        .iter()
        .map(|(key, stage)| (*key, stage.status))
        .collect();
    let ok = !record.has_failed_stage();
    log(
        env,
        &layout,
        &format!("run finished: {}", if ok { "pass" } else { "fail" }),
        &redactor,
    )?;
    info!(run_id = %record.run_id, ok, "run finished");

    Ok(RunReport {
        ok,
        run_id: record.run_id.clone(),
        run_dir: layout.run_dir.clone(),
        status: compute_status(&stages),
        stages,
        failure: record.failure.clone(),
    })
}

/// The profile's key variable plus any extra names, sorted and deduplicated.
pub fn redact_env_names(profile: &Profile, extra: &[String]) -> Vec<String> {
    let mut names: Vec<String> = profile
        .api_key_env
        .iter()
        .chain(extra)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

struct StageContext<'a> {
    env: &'a dyn Env,
    layout: &'a RunLayout,
    profile: &'a Profile,
    sdk: &'a AgentSdkInfo,
    opts: &'a RunOptions,
    redactor: &'a Redactor,
}

impl StageContext<'_> {
    fn run_stage<P: ProbeRunner>(&self, stage: ProbeStage, probes: &P) -> Result<ProbeVerdict> {
        let key = stage.key();
        log(self.env, self.layout, &format!("stage {key} started"), self.redactor)?;
        let verdict = if self.opts.mock {
            mock_verdict(stage)
        } else {
            self.probe(stage, probes)?
        };
        if stage == ProbeStage::B {
            write_json_redacted(
                &self.layout.artifact("stage_b_probe_result.json"),
                &json!({
                    "ok": verdict.passed(),
                    "duration_ms": verdict.duration_ms,
                    "payload": verdict.payload,
                    "error": verdict.error,
                }),
                self.redactor,
            )?;
        }
        let summary = match &verdict.error {
            None => format!("stage {key} passed"),
            Some(error) => format!(
                "stage {key} failed: {}: {}",
                error.kind.as_deref().unwrap_or("Error"),
                error.message.as_deref().unwrap_or("")
            ),
        };
        log(self.env, self.layout, &summary, self.redactor)?;
        Ok(verdict)
    }

    fn probe<P: ProbeRunner>(&self, stage: ProbeStage, probes: &P) -> Result<ProbeVerdict> {
        let Some(key_env) = self.profile.api_key_env.as_deref() else {
            return Ok(config_failure(
                format!("profile {} has no api_key_env", self.profile.profile_id),
                "Run `oh-llm profile edit <id> --api-key-env NAME`.",
            ));
        };
        if self
            .env
            .var(key_env)
            .is_none_or(|value| value.trim().is_empty())
        {
            return Ok(config_failure(
                format!("API key env var not set: {key_env}"),
                "Export the API key variable named in the profile before running.",
            ));
        }
        let problems = self.sdk.problems();
        if !problems.is_empty() {
            return Ok(config_failure(
                problems.join("; "),
                "Pass --sdk-path <path> or set OH_LLM_AGENT_SDK_PATH.",
            ));
        }

        let artifacts = &self.layout.artifacts_dir;
        let config = probe_config(
            self.env,
            &self.profile.resolved(),
            stage,
            &self.opts.stages,
            artifacts,
        )?;
        let config_path = artifacts.join(stage.config_file_name());
        write_json_redacted(&config_path, &config, self.redactor)?;
        let script = write_harness(artifacts)?;

        let request = ProbeRequest {
            stage,
            project_dir: self.sdk.path.clone(),
            script,
            config_path,
        };
        let result = match probes.run(&request) {
            Ok(result) => result,
            Err(err) => return Ok(launch_failure(&err)),
        };
        self.log_probe_output(stage, &result)?;
        Ok(interpret_probe(&result))
    }

    fn log_probe_output(&self, stage: ProbeStage, result: &CommandResult) -> Result<()> {
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            log(
                self.env,
                self.layout,
                &format!("stage {} stderr:\n{stderr}", stage.key()),
                self.redactor,
            )?;
        }
        Ok(())
    }
}

/// Probe configuration for `stage`, creating the stage B workspace when needed.
pub fn probe_config(
    env: &dyn Env,
    resolved: &ResolvedProfile,
    stage: ProbeStage,
    stages: &StageConfig,
    artifacts_dir: &Path,
) -> Result<ProbeConfig> {
    let mut config = ProbeConfig {
        model: resolved.model.clone(),
        base_url: resolved.base_url.clone(),
        api_key_env: resolved.api_key_env.clone(),
        timeout_s: stages.stage_a_timeout_secs,
        prompt: stage_prompt(env, stage),
        max_iterations: None,
        workspace_dir: None,
        terminal_type: None,
    };
    if stage == ProbeStage::B {
        let workspace = artifacts_dir.join(STAGE_B_WORKSPACE);
        fs::create_dir_all(&workspace)
            .with_context(|| format!("create {}", workspace.display()))?;
        config.timeout_s = stages.stage_b_timeout_secs;
        config.max_iterations = Some(stages.stage_b_max_iterations);
        config.workspace_dir = Some(workspace);
        config.terminal_type = Some(stages.stage_b_terminal_type.clone());
    }
    Ok(config)
}

fn mock_verdict(stage: ProbeStage) -> ProbeVerdict {
    let payload = match stage {
        ProbeStage::A => json!({
            "ok": true,
            "stage": "a",
            "mock": true,
            "response_preview": "hello",
        }),
        ProbeStage::B => json!({
            "ok": true,
            "stage": "b",
            "mock": true,
            "tool_invoked": true,
            "tool_observed": true,
        }),
    };
    ProbeVerdict::pass(payload, Some(0))
}

fn config_failure(message: String, hint: &str) -> ProbeVerdict {
    warn!(%message, "stage precondition failed");
    ProbeVerdict::fail(
        None,
        StageError {
            kind: Some("ConfigError".to_string()),
            message: Some(message),
            classification: Some(Classification::CredentialOrConfig),
            hint: Some(hint.to_string()),
        },
        Some(0),
    )
}

fn log(env: &dyn Env, layout: &RunLayout, message: &str, redactor: &Redactor) -> Result<()> {
    append_log(env, &layout.log_file, message, redactor)
}
