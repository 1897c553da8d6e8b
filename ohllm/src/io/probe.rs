//! Stage probes.
//!
//! A probe is an external process that exercises the agent runtime against a
//! provider and prints one JSON payload (see `schemas/probe_result.schema.json`)
//! as the last line of stdout. The [`ProbeRunner`] trait decouples the ledger
//! and the autofix validation step from how the probe is launched; tests use
//! scripted runners that return canned results.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{Classification, StageError, StageKey, StageRecord, StageStatus};
use crate::env::Env;
use crate::io::artifacts::write_atomic;
use crate::io::process::{CommandResult, describe_command, run_captured};

/// Harness script executed through the package manager.
pub const PROBE_HARNESS: &str = include_str!("../../probes/stage_probe.py");
pub const HARNESS_FILE_NAME: &str = "stage_probe.py";
const PROBE_RESULT_SCHEMA: &str = include_str!("../../schemas/probe_result.schema.json");

pub const STAGE_A_PROMPT_ENV: &str = "OH_LLM_STAGE_A_PROMPT";
pub const STAGE_B_PROMPT_ENV: &str = "OH_LLM_STAGE_B_PROMPT";
const DEFAULT_STAGE_A_PROMPT: &str = "Say hello in one word.";
const DEFAULT_STAGE_B_PROMPT: &str =
    "Use the terminal tool to run: `echo TOOL_OK`. Then reply with exactly: TOOL_OK.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    A,
    B,
}

impl ProbeStage {
    pub const ALL: [ProbeStage; 2] = [ProbeStage::A, ProbeStage::B];

    pub fn arg(self) -> &'static str {
        match self {
            ProbeStage::A => "a",
            ProbeStage::B => "b",
        }
    }

    pub fn key(self) -> StageKey {
        match self {
            ProbeStage::A => StageKey::A,
            ProbeStage::B => StageKey::B,
        }
    }

    pub fn config_file_name(self) -> &'static str {
        match self {
            ProbeStage::A => "stage_a_config.json",
            ProbeStage::B => "stage_b_config.json",
        }
    }
}

/// Prompt for `stage`, overridable through `OH_LLM_STAGE_{A,B}_PROMPT`.
pub fn stage_prompt(env: &dyn Env, stage: ProbeStage) -> String {
    let (var, default) = match stage {
        ProbeStage::A => (STAGE_A_PROMPT_ENV, DEFAULT_STAGE_A_PROMPT),
        ProbeStage::B => (STAGE_B_PROMPT_ENV, DEFAULT_STAGE_B_PROMPT),
    };
    env.var(var)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Contents of `stage_{a,b}_config.json`. Holds the key's variable name, never the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_s: u64,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_type: Option<String>,
}

/// Parameters for one probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub stage: ProbeStage,
    /// Project directory the package manager runs in (runtime checkout or worktree).
    pub project_dir: PathBuf,
    pub script: PathBuf,
    pub config_path: PathBuf,
}

/// Abstraction over probe launchers.
pub trait ProbeRunner {
    /// Run the probe to completion. `Err` means it could not be launched at all.
    fn run(&self, request: &ProbeRequest) -> Result<CommandResult>;
}

/// Runs `uv --directory <project> run python <script> --stage <s> --config <cfg>`.
pub struct UvProbeRunner {
    uv_bin: String,
}

impl UvProbeRunner {
    pub fn new(uv_bin: impl Into<String>) -> Self {
        Self {
            uv_bin: uv_bin.into(),
        }
    }
}

impl ProbeRunner for UvProbeRunner {
    #[instrument(skip_all, fields(stage = request.stage.arg()))]
    fn run(&self, request: &ProbeRequest) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.uv_bin);
        cmd.arg("--directory")
            .arg(&request.project_dir)
            .args(["run", "python"])
            .arg(&request.script)
            .args(["--stage", request.stage.arg(), "--config"])
            .arg(&request.config_path)
            .env_remove("VIRTUAL_ENV")
            .env("NO_COLOR", "1");
        let command = describe_command(&cmd);
        debug!(command = ?command, "running probe");
        let output = run_captured(cmd)?;
        Ok(CommandResult::from_output(command, &output))
    }
}

/// Write the harness script into `dir`, returning its path.
pub fn write_harness(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(HARNESS_FILE_NAME);
    write_atomic(&path, PROBE_HARNESS)?;
    Ok(path)
}

/// Last stdout line that parses as a JSON object.
pub fn parse_probe_payload(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        })
}

/// Validate a payload against the probe result schema (Draft 2020-12).
pub fn validate_payload_shape(payload: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(PROBE_RESULT_SCHEMA).context("parse probe result schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile probe result schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(payload)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("{}", messages.join("; "));
    }
    Ok(())
}

/// Outcome of one probe, ready to be stored as a stage record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeVerdict {
    pub status: StageStatus,
    pub payload: Option<Value>,
    pub error: Option<StageError>,
    pub duration_ms: Option<u64>,
}

impl ProbeVerdict {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Pass
    }

    pub fn pass(payload: Value, duration_ms: Option<u64>) -> Self {
        Self {
            status: StageStatus::Pass,
            payload: Some(payload),
            error: None,
            duration_ms,
        }
    }

    pub fn fail(payload: Option<Value>, error: StageError, duration_ms: Option<u64>) -> Self {
        Self {
            status: StageStatus::Fail,
            payload,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn into_stage_record(self, key: StageKey) -> StageRecord {
        StageRecord {
            name: key.title().to_string(),
            status: self.status,
            duration_ms: self.duration_ms,
            result: self.payload,
            error: self.error,
        }
    }
}

/// The probe could not be launched (package manager missing, spawn error).
pub fn launch_failure(err: &anyhow::Error) -> ProbeVerdict {
    warn!(%err, "probe launch failed");
    ProbeVerdict::fail(
        None,
        StageError {
            kind: Some("AgentSdkError".to_string()),
            message: Some(format!("Failed to run probe via uv: {err:#}")),
            classification: Some(Classification::CredentialOrConfig),
            hint: Some("Check that `uv` is installed and the agent SDK path is correct.".to_string()),
        },
        None,
    )
}

/// Interpret a finished probe.
///
/// Passing requires both a zero exit status and `"ok": true`. A payload that is
/// missing or malformed is a probe error, classified as an SDK/provider bug.
pub fn interpret_probe(result: &CommandResult) -> ProbeVerdict {
    let exit = result
        .exit_code
        .map_or_else(|| "signal".to_string(), |code| code.to_string());
    let Some(payload) = parse_probe_payload(&result.stdout) else {
        return ProbeVerdict::fail(
            None,
            probe_error(format!("Probe produced no JSON output (exit {exit})")),
            Some(result.duration_ms),
        );
    };
    let duration_ms = payload
        .get("duration_ms")
        .and_then(Value::as_u64)
        .or(Some(result.duration_ms));
    if let Err(err) = validate_payload_shape(&payload) {
        return ProbeVerdict::fail(
            Some(payload),
            probe_error(format!("Probe output failed schema validation: {err}")),
            duration_ms,
        );
    }
    let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if ok && !result.succeeded() {
        return ProbeVerdict::fail(
            Some(payload),
            probe_error(format!("Probe exited with status {exit}")),
            duration_ms,
        );
    }
    if ok {
        return ProbeVerdict::pass(payload, duration_ms);
    }

    let text = |field: &str| payload.get(field).and_then(Value::as_str).map(str::to_string);
    let error = StageError {
        kind: text("error_type").or_else(|| Some("ProbeError".to_string())),
        message: text("error").or_else(|| Some(format!("Probe reported failure (exit {exit})"))),
        classification: payload
            .get("classification")
            .and_then(|value| serde_json::from_value(value.clone()).ok()),
        hint: text("hint"),
    };
    ProbeVerdict::fail(Some(payload), error, duration_ms)
}

fn probe_error(message: String) -> StageError {
    StageError {
        kind: Some("ProbeError".to_string()),
        message: Some(message),
        classification: Some(Classification::SdkOrProviderBug),
        hint: None,
    }
}
