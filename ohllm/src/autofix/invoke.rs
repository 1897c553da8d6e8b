//! Coding agent step: context file, agent run, transcript and worktree patch.

use std::path::{Path, PathBuf};

use anyhow::Result;
use minijinja::context;
use serde_json::json;
use tracing::{info, instrument};

use crate::autofix::capsule::CapsuleArtifacts;
use crate::autofix::render::render;
use crate::core::redaction::Redactor;
use crate::core::types::RunRecord;
use crate::env::{Env, timestamp};
use crate::io::agent::{AgentRequest, AgentRun, CodingAgent};
use crate::io::artifacts::{
    PRIVATE_FILE_MODE, restrict_permissions, write_json_redacted, write_text_redacted,
};
use crate::io::git::Git;
use crate::io::ledger::RunLayout;
use crate::io::worktree::WorktreeRecord;

pub const CONTEXT_MD: &str = "autofix_openhands_context.md";
pub const TRANSCRIPT_LOG: &str = "autofix_openhands_transcript.log";
pub const WORKTREE_PATCH: &str = "autofix_openhands_worktree.patch";
pub const AGENT_RUN_JSON: &str = "autofix_openhands_run.json";

/// Short task string; the details live in the context file.
pub fn agent_task(context_path: &Path) -> String {
    format!(
        "You are a coding agent running in an agent-sdk git worktree. \
         Read the local context file and follow its instructions:\n\n  {}\n",
        context_path.display()
    )
}

pub struct AgentStep<'a> {
    pub env: &'a dyn Env,
    pub layout: &'a RunLayout,
    pub record: &'a RunRecord,
    pub worktree: &'a WorktreeRecord,
    pub capsule: &'a CapsuleArtifacts,
    pub redactor: &'a Redactor,
}

impl AgentStep<'_> {
    /// Run the agent in the worktree. Its exit status is recorded, never judged.
    #[instrument(skip_all, fields(worktree = %self.worktree.path().display()))]
    pub fn run<A: CodingAgent>(&self, agent: &A, bin: &Path) -> Result<AgentRun> {
        let context_path = self.write_context()?;
        let transcript_path = self.layout.artifact(TRANSCRIPT_LOG);

        let started_at = timestamp(self.env.now());
        let run = agent.run(
            &AgentRequest {
                bin: bin.to_path_buf(),
                workdir: self.worktree.path().to_path_buf(),
                task: agent_task(&context_path),
                transcript_path: transcript_path.clone(),
            },
            self.redactor,
        )?;
        let finished_at = timestamp(self.env.now());
        restrict_permissions(&transcript_path, PRIVATE_FILE_MODE);
        info!(exit_code = ?run.exit_code, "agent finished");

        let patch_path = self.write_patch()?;
        let run_json = self.layout.artifact(AGENT_RUN_JSON);
        write_json_redacted(
            &run_json,
            &json!({
                "schema_version": 1,
                "started_at": started_at,
                "finished_at": finished_at,
                "openhands": &run,
                "artifacts": {
                    "context_md": context_path,
                    "transcript_log": transcript_path,
                    "diff_patch": patch_path,
                },
            }),
            self.redactor,
        )?;
        restrict_permissions(&run_json, PRIVATE_FILE_MODE);
        Ok(run)
    }

    fn write_context(&self) -> Result<PathBuf> {
        let path = self.layout.artifact(CONTEXT_MD);
        let worktree_record = serde_json::to_string_pretty(self.worktree)?;
        let body = render(
            "agent_context",
            context! {
                run_dir => self.layout.run_dir.display().to_string(),
                profile => &self.record.profile.name,
                model => self.record.profile.resolved.as_ref().map(|resolved| resolved.model.as_str()),
                worktree => self.worktree.path().display().to_string(),
                capsule => self.capsule.capsule_md.display().to_string(),
                repro => self.capsule.repro_script.display().to_string(),
                artifacts_dir => self.layout.artifacts_dir.display().to_string(),
                worktree_record => worktree_record,
            },
        )?;
        write_text_redacted(&path, &body, self.redactor)?;
        restrict_permissions(&path, PRIVATE_FILE_MODE);
        Ok(path)
    }

    fn write_patch(&self) -> Result<PathBuf> {
        let path = self.layout.artifact(WORKTREE_PATCH);
        let git = Git::new(self.worktree.path());
        let payload = format!(
            "# git status --porcelain=v1\n{}\n# git diff HEAD\n{}",
            git.status_porcelain()?,
            git.diff_head()?
        );
        write_text_redacted(&path, &payload, self.redactor)?;
        restrict_permissions(&path, PRIVATE_FILE_MODE);
        Ok(path)
    }
}
