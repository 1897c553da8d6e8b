//! Failure capsule: everything the coding agent needs to reproduce the failure.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use minijinja::context;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::autofix::render::render;
use crate::core::redaction::Redactor;
use crate::core::types::{Failure, ProfileDescriptor, RunRecord, SdkSnapshot, StageKey, StageRecord};
use crate::env::{Env, timestamp};
use crate::io::artifacts::{
    PRIVATE_FILE_MODE, PRIVATE_SCRIPT_MODE, restrict_permissions, write_atomic,
    write_json_redacted, write_text_redacted,
};
use crate::io::config::{AGENT_SDK_PATH_ENV, StageConfig};
use crate::io::ledger::RunLayout;
use crate::io::probe::{PROBE_HARNESS, ProbeStage};
use crate::run::probe_config;

pub const CAPSULE_JSON: &str = "autofix_capsule.json";
pub const CAPSULE_MD: &str = "autofix_capsule.md";
pub const REPRO_SCRIPT: &str = "autofix_repro.py";

const LOG_TAIL_LINES: usize = 120;
const LOG_TAIL_MAX_BYTES: usize = 50_000;

#[derive(Debug, Clone, Serialize)]
pub struct CapsuleArtifacts {
    pub capsule_json: PathBuf,
    pub capsule_md: PathBuf,
    pub repro_script: PathBuf,
}

#[derive(Debug, Serialize)]
struct Capsule<'a> {
    schema_version: u32,
    created_at: String,
    run_dir: &'a Path,
    run_id: &'a str,
    profile: &'a ProfileDescriptor,
    agent_sdk: Option<&'a SdkSnapshot>,
    failure: Option<&'a Failure>,
    stages: &'a BTreeMap<StageKey, StageRecord>,
    log_tail: String,
    stage_b_probe_result: Option<Value>,
    how_to_repro: Repro,
}

#[derive(Debug, Serialize)]
struct Repro {
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    commands: Vec<String>,
}

/// Write the capsule (JSON and markdown), the repro harness and the stage configs.
///
/// An existing `autofix_repro.py` or stage config is left alone so a
/// hand-edited harness survives re-entry.
#[instrument(skip_all, fields(run_id = %record.run_id))]
pub fn write_capsule(
    env: &dyn Env,
    layout: &RunLayout,
    record: &RunRecord,
    stages: &StageConfig,
    redactor: &Redactor,
) -> Result<CapsuleArtifacts> {
    let artifacts = CapsuleArtifacts {
        capsule_json: layout.artifact(CAPSULE_JSON),
        capsule_md: layout.artifact(CAPSULE_MD),
        repro_script: layout.artifact(REPRO_SCRIPT),
    };

    let stage_b_probe_result = fs::read_to_string(layout.artifact("stage_b_probe_result.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
    let repro = Repro {
        cwd: layout.artifacts_dir.clone(),
        env: BTreeMap::from([(
            AGENT_SDK_PATH_ENV.to_string(),
            "$HOME/repos/agent-sdk".to_string(),
        )]),
        commands: ProbeStage::ALL
            .iter()
            .map(|stage| {
                format!(
                    "uv --directory \"${AGENT_SDK_PATH_ENV}\" run python {REPRO_SCRIPT} --stage {} --config {}",
                    stage.arg(),
                    stage.config_file_name()
                )
            })
            .collect(),
    };
    let capsule = Capsule {
        schema_version: 1,
        created_at: timestamp(env.now()),
        run_dir: &layout.run_dir,
        run_id: &record.run_id,
        profile: &record.profile,
        agent_sdk: record.agent_sdk.as_ref(),
        failure: record.failure.as_ref(),
        stages: &record.stages,
        log_tail: read_log_tail(&layout.log_file),
        stage_b_probe_result,
        how_to_repro: repro,
    };
    write_json_redacted(&artifacts.capsule_json, &capsule, redactor)?;
    restrict_permissions(&artifacts.capsule_json, PRIVATE_FILE_MODE);

    let markdown = render(
        "capsule",
        context! {
            run_id => &capsule.run_id,
            run_dir => layout.run_dir.display().to_string(),
            profile => &record.profile.name,
            failure => capsule.failure,
            repro_cwd => capsule.how_to_repro.cwd.display().to_string(),
            commands => &capsule.how_to_repro.commands,
            log_tail => &capsule.log_tail,
        },
    )?;
    write_text_redacted(&artifacts.capsule_md, &markdown, redactor)?;
    restrict_permissions(&artifacts.capsule_md, PRIVATE_FILE_MODE);

    if artifacts.repro_script.exists() {
        debug!("keeping existing repro harness");
    } else {
        write_atomic(&artifacts.repro_script, PROBE_HARNESS)?;
        restrict_permissions(&artifacts.repro_script, PRIVATE_SCRIPT_MODE);
    }
    write_missing_stage_configs(env, layout, record, stages, redactor)?;
    Ok(artifacts)
}

fn write_missing_stage_configs(
    env: &dyn Env,
    layout: &RunLayout,
    record: &RunRecord,
    stages: &StageConfig,
    redactor: &Redactor,
) -> Result<()> {
    let Some(resolved) = record
        .profile
        .resolved
        .as_ref()
        .filter(|resolved| !resolved.model.trim().is_empty())
    else {
        debug!("profile model unknown, not writing stage configs");
        return Ok(());
    };
    for stage in ProbeStage::ALL {
        let path = layout.artifact(stage.config_file_name());
        if path.exists() {
            continue;
        }
        let config = probe_config(env, resolved, stage, stages, &layout.artifacts_dir)?;
        write_json_redacted(&path, &config, redactor)?;
        restrict_permissions(&path, PRIVATE_FILE_MODE);
    }
    Ok(())
}

/// Last [`LOG_TAIL_LINES`] lines of the run log; empty when unreadable.
fn read_log_tail(path: &Path) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(LOG_TAIL_MAX_BYTES);
    tail_lines(&String::from_utf8_lossy(&bytes[start..]), LOG_TAIL_LINES)
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n").trim().to_string()
}
