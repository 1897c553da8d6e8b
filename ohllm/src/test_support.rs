//! Test-only fixtures: git repositories, a pinned environment, and scripted
//! stand-ins for the coding agent, the probes, and the pull-request host.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::redaction::Redactor;
use crate::env::Env;
use crate::io::agent::{AgentRequest, AgentRun, CodingAgent, recorded_args};
use crate::io::artifacts::write_text_redacted;
use crate::io::gh::{PrHost, PrRequest};
use crate::io::probe::{ProbeRequest, ProbeRunner, ProbeStage};
use crate::io::process::CommandResult;

/// Environment with fixed variables, home, clock and run ids.
#[derive(Debug)]
pub struct FixedEnv {
    vars: BTreeMap<String, String>,
    home: Option<PathBuf>,
    now: DateTime<Utc>,
    run_ids: RefCell<VecDeque<String>>,
    counter: Cell<u64>,
}

impl Default for FixedEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedEnv {
    /// Clock pinned to 2025-01-02T03:04:05Z, no variables, no home.
    pub fn new() -> Self {
        Self {
            vars: BTreeMap::new(),
            home: None,
            now: Utc
                .with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
                .single()
                .unwrap_or_default(),
            run_ids: RefCell::new(VecDeque::new()),
            counter: Cell::new(0),
        }
    }

    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_home(mut self, home: impl AsRef<Path>) -> Self {
        self.home = Some(home.as_ref().to_path_buf());
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Run ids handed out in order; afterwards ids count up from `000000000001`.
    pub fn with_run_ids<'a>(self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.run_ids
            .borrow_mut()
            .extend(ids.into_iter().map(str::to_string));
        self
    }
}

impl Env for FixedEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn new_run_id(&self) -> String {
        if let Some(id) = self.run_ids.borrow_mut().pop_front() {
            return id;
        }
        let next = self.counter.get() + 1;
        self.counter.set(next);
        format!("{next:012x}")
    }
}

/// Throwaway git repository with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.write_file("README.md", "# agent sdk fixture\n")?;
        repo.commit_all("initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&[
            "-c",
            "user.name=Fixture",
            "-c",
            "user.email=fixture@example.invalid",
            "-c",
            "commit.gpgsign=false",
            "commit",
            "-q",
            "-m",
            message,
        ])?;
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .current_dir(self.path())
            .status()
            .context("spawn git show-ref")?;
        Ok(status.success())
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        run_git(self.path(), args)
    }
}

/// `git init --bare` at `path`, standing in for a fork remote.
pub fn init_bare_repo(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    run_git(path, &["init", "-q", "--bare"])?;
    Ok(())
}

pub fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Coding agent that writes fixed files into the worktree and a fixed transcript.
pub struct ScriptedAgent {
    edits: Vec<(String, String)>,
    transcript: Vec<String>,
    exit_code: Option<i32>,
    calls: Cell<usize>,
}

impl ScriptedAgent {
    pub fn new(edits: &[(&str, &str)]) -> Self {
        Self {
            edits: edits
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
            transcript: Vec::new(),
            exit_code: Some(0),
            calls: Cell::new(0),
        }
    }

    pub fn with_transcript(mut self, lines: &[&str]) -> Self {
        self.transcript = lines.iter().map(|line| line.to_string()).collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl CodingAgent for ScriptedAgent {
    fn resolve_binary(&self, _env: &dyn Env) -> Result<PathBuf> {
        Ok(PathBuf::from("scripted-agent"))
    }

    fn run(&self, request: &AgentRequest, redactor: &Redactor) -> Result<AgentRun> {
        self.calls.set(self.calls.get() + 1);
        for (rel, contents) in &self.edits {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        let mut text = self.transcript.join("\n");
        text.push('\n');
        write_text_redacted(&request.transcript_path, &text, redactor)?;
        Ok(AgentRun {
            bin: request.bin.display().to_string(),
            args: recorded_args(),
            cwd: request.workdir.clone(),
            exit_code: self.exit_code,
        })
    }
}

/// Probe runner returning canned results per stage.
pub struct ScriptedProbes {
    stage_a: CommandResult,
    stage_b: CommandResult,
    requests: RefCell<Vec<ProbeRequest>>,
}

impl ScriptedProbes {
    pub fn new(stage_a: CommandResult, stage_b: CommandResult) -> Self {
        Self {
            stage_a,
            stage_b,
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Both stages exit 0 with `"ok": true`.
    pub fn passing() -> Self {
        Self::new(
            probe_output(0, json!({"ok": true, "stage": "a", "response_preview": "hello"})),
            probe_output(
                0,
                json!({"ok": true, "stage": "b", "tool_invoked": true, "tool_observed": true}),
            ),
        )
    }

    pub fn requests(&self) -> Vec<ProbeRequest> {
        self.requests.borrow().clone()
    }
}

impl ProbeRunner for ScriptedProbes {
    fn run(&self, request: &ProbeRequest) -> Result<CommandResult> {
        self.requests.borrow_mut().push(request.clone());
        Ok(match request.stage {
            ProbeStage::A => self.stage_a.clone(),
            ProbeStage::B => self.stage_b.clone(),
        })
    }
}

/// A finished probe: one line of noise, then `payload` as the last stdout line.
pub fn probe_output(exit_code: i32, payload: Value) -> CommandResult {
    CommandResult {
        command: vec!["uv".to_string(), "run".to_string()],
        exit_code: Some(exit_code),
        duration_ms: 5,
        stdout: format!("probe starting\n{payload}\n"),
        stderr: String::new(),
    }
}

/// PR host that records requests and returns a fixed URL.
pub struct RecordingPrHost {
    url: String,
    login: String,
    requests: RefCell<Vec<PrRequest>>,
}

impl RecordingPrHost {
    pub fn new(url: &str, login: &str) -> Self {
        Self {
            url: url.to_string(),
            login: login.to_string(),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PrRequest> {
        self.requests.borrow().clone()
    }
}

impl PrHost for RecordingPrHost {
    fn current_login(&self, _workdir: &Path) -> Result<String> {
        Ok(self.login.clone())
    }

    fn create_pr(&self, request: &PrRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        Ok(self.url.clone())
    }
}
