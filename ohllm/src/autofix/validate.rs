//! Re-run both probes inside the worktree and persist the verdicts.

use std::path::{Path, PathBuf};

use anyhow::Result;
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::autofix::render::render;
use crate::core::redaction::Redactor;
use crate::core::types::{Classification, StageError};
use crate::env::{Env, timestamp};
use crate::io::artifacts::{
    PRIVATE_FILE_MODE, read_json, restrict_permissions, write_json_redacted, write_text_redacted,
};
use crate::io::ledger::RunLayout;
use crate::io::probe::{
    ProbeRequest, ProbeRunner, ProbeStage, ProbeVerdict, interpret_probe, launch_failure,
};
use crate::io::process::CommandResult;

pub const VALIDATION_JSON: &str = "autofix_validation.json";
pub const VALIDATION_MD: &str = "autofix_validation.md";

/// Compact per-stage verdict kept in the combined summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageValidation {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

/// Contents of `autofix_validation.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub schema_version: u32,
    pub created_at: String,
    pub worktree: PathBuf,
    /// Both stages passed.
    pub ok: bool,
    pub stage_a: StageValidation,
    pub stage_b: StageValidation,
}

impl ValidationSummary {
    pub fn stages(&self) -> [(&'static str, &StageValidation); 2] {
        [("a", &self.stage_a), ("b", &self.stage_b)]
    }
}

/// `autofix_validation_stage_{a,b}.json`.
pub fn stage_artifact(stage: ProbeStage) -> String {
    format!("autofix_validation_stage_{}.json", stage.arg())
}

/// Run stage A and stage B through the repro harness with the worktree as project.
///
/// A stage passes only when the harness exits zero and its payload says `ok`.
#[instrument(skip_all, fields(worktree = %worktree.display()))]
pub fn validate_worktree<P: ProbeRunner>(
    env: &dyn Env,
    layout: &RunLayout,
    worktree: &Path,
    repro_script: &Path,
    probes: &P,
    redactor: &Redactor,
) -> Result<ValidationSummary> {
    let stage_a = validate_stage(layout, worktree, repro_script, ProbeStage::A, probes, redactor)?;
    let stage_b = validate_stage(layout, worktree, repro_script, ProbeStage::B, probes, redactor)?;
    let summary = ValidationSummary {
        schema_version: 1,
        created_at: timestamp(env.now()),
        worktree: worktree.to_path_buf(),
        ok: stage_a.ok && stage_b.ok,
        stage_a,
        stage_b,
    };
    info!(ok = summary.ok, "validation finished");

    let json_path = layout.artifact(VALIDATION_JSON);
    write_json_redacted(&json_path, &summary, redactor)?;
    restrict_permissions(&json_path, PRIVATE_FILE_MODE);

    let stages: Vec<Value> = summary
        .stages()
        .iter()
        .map(|(name, stage)| {
            json!({
                "name": name,
                "ok": stage.ok,
                "exit_code": stage.exit_code,
                "duration_ms": stage.duration_ms,
                "message": stage.error.as_ref().and_then(|error| error.message.clone()),
            })
        })
        .collect();
    let markdown = render(
        "validation",
        context! {
            worktree => worktree.display().to_string(),
            ok => summary.ok,
            stages => stages,
        },
    )?;
    let md_path = layout.artifact(VALIDATION_MD);
    write_text_redacted(&md_path, &markdown, redactor)?;
    restrict_permissions(&md_path, PRIVATE_FILE_MODE);
    Ok(summary)
}

/// A previously persisted summary, if one exists and parses.
pub fn load_validation(layout: &RunLayout) -> Option<ValidationSummary> {
    let path = layout.artifact(VALIDATION_JSON);
    if !path.exists() {
        return None;
    }
    read_json(&path)
        .inspect_err(|err| debug!(%err, "ignoring unreadable validation summary"))
        .ok()
}

fn validate_stage<P: ProbeRunner>(
    layout: &RunLayout,
    worktree: &Path,
    repro_script: &Path,
    stage: ProbeStage,
    probes: &P,
    redactor: &Redactor,
) -> Result<StageValidation> {
    let config_path = layout.artifact(stage.config_file_name());
    let (verdict, result) = if config_path.exists() {
        let request = ProbeRequest {
            stage,
            project_dir: worktree.to_path_buf(),
            script: repro_script.to_path_buf(),
            config_path,
        };
        match probes.run(&request) {
            Ok(result) => (interpret_probe(&result), Some(result)),
            Err(err) => (launch_failure(&err), None),
        }
    } else {
        (missing_config(stage), None)
    };

    let validation = StageValidation {
        ok: verdict.passed(),
        exit_code: result.as_ref().and_then(|result| result.exit_code),
        duration_ms: result
            .as_ref()
            .map_or(0, |result| result.duration_ms),
        error: verdict.error.clone(),
    };
    let path = layout.artifact(&stage_artifact(stage));
    write_json_redacted(&path, &stage_payload(&validation, &verdict, result.as_ref()), redactor)?;
    restrict_permissions(&path, PRIVATE_FILE_MODE);
    Ok(validation)
}

fn stage_payload(
    validation: &StageValidation,
    verdict: &ProbeVerdict,
    result: Option<&CommandResult>,
) -> Value {
    json!({
        "ok": validation.ok,
        "result": result,
        "payload": verdict.payload,
        "error": verdict.error,
    })
}

fn missing_config(stage: ProbeStage) -> ProbeVerdict {
    ProbeVerdict::fail(
        None,
        StageError {
            kind: Some("ConfigError".to_string()),
            message: Some(format!("missing {}", stage.config_file_name())),
            classification: Some(Classification::CredentialOrConfig),
            hint: Some("The run record has no resolved model; re-run `oh-llm run`.".to_string()),
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedEnv, ScriptedProbes, probe_output};
    use std::fs;

    fn layout_with_configs(root: &Path) -> RunLayout {
        let layout = RunLayout::new(root);
        fs::create_dir_all(&layout.artifacts_dir).expect("mkdir");
        for stage in ProbeStage::ALL {
            fs::write(layout.artifact(stage.config_file_name()), "{}").expect("config");
        }
        layout
    }

    #[test]
    fn both_stages_must_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout_with_configs(temp.path());
        let probes = ScriptedProbes::new(
            probe_output(0, json!({"ok": true})),
            probe_output(0, json!({"ok": false, "error": "tool never called"})),
        );

        let summary = validate_worktree(
            &FixedEnv::new(),
            &layout,
            Path::new("/wt"),
            &layout.artifact("autofix_repro.py"),
            &probes,
            &Redactor::default(),
        )
        .expect("validate");

        assert!(summary.stage_a.ok);
        assert!(!summary.stage_b.ok);
        assert!(!summary.ok);
        let requests = probes.requests();
        assert!(requests.iter().all(|request| request.project_dir == Path::new("/wt")));
        assert!(layout.artifact("autofix_validation_stage_a.json").exists());
        assert!(layout.artifact("autofix_validation_stage_b.json").exists());
        let md = fs::read_to_string(layout.artifact(VALIDATION_MD)).expect("md");
        assert!(md.contains("- stage b: `false`"));
        assert_eq!(load_validation(&layout), Some(summary));
    }

    #[test]
    fn probe_output_is_redacted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout_with_configs(temp.path());
        let probes = ScriptedProbes::new(
            probe_output(0, json!({"ok": true, "response_preview": "key=val-secret-77"})),
            probe_output(0, json!({"ok": true})),
        );

        let summary = validate_worktree(
            &FixedEnv::new(),
            &layout,
            Path::new("/wt"),
            &layout.artifact("autofix_repro.py"),
            &probes,
            &Redactor::new(["val-secret-77"]),
        )
        .expect("validate");

        assert!(summary.ok);
        let stage_a =
            fs::read_to_string(layout.artifact("autofix_validation_stage_a.json")).expect("read");
        assert!(!stage_a.contains("val-secret-77"));
        assert!(stage_a.contains("<REDACTED>"));
    }

    #[test]
    fn missing_config_fails_without_running_probe() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RunLayout::new(temp.path());
        let probes = ScriptedProbes::passing();

        let summary = validate_worktree(
            &FixedEnv::new(),
            &layout,
            Path::new("/wt"),
            &layout.artifact("autofix_repro.py"),
            &probes,
            &Redactor::default(),
        )
        .expect("validate");

        assert!(!summary.ok);
        assert!(probes.requests().is_empty());
        assert_eq!(
            summary.stage_a.error.and_then(|error| error.classification),
            Some(Classification::CredentialOrConfig)
        );
    }
}
