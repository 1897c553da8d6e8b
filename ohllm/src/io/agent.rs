//! Coding agent abstraction.
//!
//! The [`CodingAgent`] trait decouples the autofix pipeline from the actual
//! agent backend (currently the `openhands` CLI in headless mode). Tests use
//! scripted agents that edit the worktree directly without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::redaction::Redactor;
use crate::env::Env;
use crate::error::Error;
use crate::io::process::{find_executable, run_streaming_redacted};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub bin: PathBuf,
    /// Worktree the agent edits; also its working directory.
    pub workdir: PathBuf,
    pub task: String,
    pub transcript_path: PathBuf,
}

/// What the agent invocation looked like, for `autofix_openhands_run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRun {
    pub bin: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub exit_code: Option<i32>,
}

pub trait CodingAgent {
    /// Locate the agent binary. Called before any worktree is created.
    fn resolve_binary(&self, env: &dyn Env) -> Result<PathBuf>;

    /// Run the agent to completion. A non-zero exit is reported, not an error.
    fn run(&self, request: &AgentRequest, redactor: &Redactor) -> Result<AgentRun>;
}

/// `openhands --headless --always-approve -t <task>`.
pub struct OpenHandsCli {
    bin: String,
}

impl OpenHandsCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

/// Arguments recorded in artifacts; the task text itself lives in the context file.
pub fn recorded_args() -> Vec<String> {
    ["--headless", "--always-approve", "-t", "<task>"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl CodingAgent for OpenHandsCli {
    fn resolve_binary(&self, env: &dyn Env) -> Result<PathBuf> {
        find_executable(env, &self.bin).ok_or_else(|| {
            Error::Config(format!(
                "OpenHands CLI not found on PATH ('{}'); pass --openhands-bin",
                self.bin
            ))
            .into()
        })
    }

    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &AgentRequest, redactor: &Redactor) -> Result<AgentRun> {
        info!(bin = %request.bin.display(), "starting coding agent");
        let mut cmd = Command::new(&request.bin);
        cmd.args(["--headless", "--always-approve", "-t"])
            .arg(&request.task)
            .current_dir(&request.workdir)
            .env("NO_COLOR", "1");
        let header = vec![
            format!("bin: {}", request.bin.display()),
            format!("cwd: {}", request.workdir.display()),
            String::new(),
        ];
        let status = run_streaming_redacted(cmd, &request.transcript_path, &header, redactor)?;
        info!(exit_code = ?status.code(), "coding agent finished");
        Ok(AgentRun {
            bin: request.bin.display().to_string(),
            args: recorded_args(),
            cwd: request.workdir.clone(),
            exit_code: status.code(),
        })
    }
}
