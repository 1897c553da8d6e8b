//! End-to-end autofix scenarios with a scripted agent, probes and PR host.
//!
//! The agent SDK checkout is a real throwaway git repository, so worktree
//! creation, commits, pushes (to a local bare repository) and cleanup all run
//! against git.

use std::fs;
use std::path::{Path, PathBuf};

use ohllm::autofix::pr::{ForkTarget, PrTarget};
use ohllm::autofix::{
    AutofixOptions, AutofixOutcome, AutofixState, RefusalReason, WORKTREE_DIR, WORKTREE_JSON,
    run_autofix,
};
use ohllm::core::redaction::Redactor;
use ohllm::core::types::{
    ProfileDescriptor, ResolvedProfile, RunRecord, StageError, StageKey, StageRecord, StageStatus,
};
use ohllm::error::Error;
use ohllm::io::config::StageConfig;
use ohllm::io::ledger::{RunLayout, create_run, write_run_record};
use ohllm::io::worktree::load_worktree_record;
use ohllm::test_support::{
    FixedEnv, RecordingPrHost, ScriptedAgent, ScriptedProbes, TestRepo, init_bare_repo,
    probe_output, run_git,
};
use serde_json::{Value, json};

const SECRET: &str = "canary-secret-5f2e9c";
const PR_URL: &str = "https://github.com/OpenHands/software-agent-sdk/pull/7";

struct Fixture {
    runs: tempfile::TempDir,
    sdk: TestRepo,
    env: FixedEnv,
}

impl Fixture {
    fn new() -> Self {
        Self {
            runs: tempfile::tempdir().expect("runs dir"),
            sdk: TestRepo::new().expect("sdk repo"),
            env: FixedEnv::new().with_var("ACME_API_KEY", SECRET),
        }
    }

    /// A run whose stage B failed with `message`; stage A passed.
    fn run_with(&self, stage_b: Option<&str>) -> PathBuf {
        let run = create_run(&self.env, self.runs.path(), "acme").expect("create run");
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
            StageKey::A,
            StageRecord {
                status: StageStatus::Pass,
                ..StageRecord::not_run(StageKey::A)
            },
        );
        record.set_stage(
            StageKey::B,
            StageRecord {
                status: if stage_b.is_some() {
                    StageStatus::Fail
                } else {
                    StageStatus::Pass
                },
                error: stage_b.map(|message| StageError {
                    kind: Some("BadRequestError".to_string()),
                    message: Some(message.to_string()),
                    ..StageError::default()
                }),
                ..StageRecord::not_run(StageKey::B)
            },
        );
        write_run_record(&run.layout.run_json, &mut record, &Redactor::default())
            .expect("write record");
        run.layout.run_dir
    }

    fn options(&self) -> AutofixOptions {
        AutofixOptions {
            sdk_path: self.sdk.path().to_path_buf(),
            force: false,
            dry_run: true,
            keep_worktree: false,
            allow_dirty_sdk: false,
            fork: ForkTarget {
                owner: None,
                url: None,
                remote: "oh-llm-fork".to_string(),
            },
            target: PrTarget {
                upstream_repo: "OpenHands/software-agent-sdk".to_string(),
                base: "main".to_string(),
                draft: false,
            },
            stages: StageConfig::default(),
        }
    }
}

fn fixing_agent() -> ScriptedAgent {
    ScriptedAgent::new(&[
        ("openhands/sdk/llm/fix.py", "TOOL_CALLS_SUPPORTED = False\n"),
        ("openhands/sdk/llm/__pycache__/fix.cpython-312.pyc", "\u{0}bytecode"),
    ])
    .with_transcript(&["reading capsule", &format!("export ACME_API_KEY={SECRET}")])
}

fn failing_stage_b() -> ScriptedProbes {
    ScriptedProbes::new(
        probe_output(0, json!({"ok": true, "stage": "a"})),
        probe_output(
            1,
            json!({"ok": false, "stage": "b", "error": "tool_calls rejected", "error_type": "BadRequestError"}),
        ),
    )
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read json")).expect("parse json")
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("read dir") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

#[test]
fn credential_failure_is_refused_even_for_dry_run() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(Some("401 Unauthorized: invalid api key"));
    let agent = fixing_agent();
    let host = RecordingPrHost::new(PR_URL, "octo");

    let report = run_autofix(
        &fixture.env,
        &run_dir,
        &fixture.options(),
        &agent,
        &ScriptedProbes::passing(),
        &host,
    )
    .expect("autofix");

    assert_eq!(
        report.outcome,
        AutofixOutcome::Refused {
            reason: RefusalReason::CredentialOrConfig
        }
    );
    assert!(!report.ok);
    assert_eq!(agent.calls(), 0);
    assert!(!RunLayout::new(&run_dir).artifact(WORKTREE_DIR).exists());
    let log = fs::read_to_string(RunLayout::new(&run_dir).log_file).expect("log");
    assert!(log.contains("autofix refused: credential_or_config"));
}

#[test]
fn passing_run_needs_force() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(None);
    let agent = fixing_agent();
    let host = RecordingPrHost::new(PR_URL, "octo");
    let probes = ScriptedProbes::passing();

    let refused = run_autofix(
        &fixture.env,
        &run_dir,
        &fixture.options(),
        &agent,
        &probes,
        &host,
    )
    .expect("autofix");
    assert_eq!(
        refused.outcome,
        AutofixOutcome::Refused {
            reason: RefusalReason::NoFailure
        }
    );

    let forced = run_autofix(
        &fixture.env,
        &run_dir,
        &AutofixOptions {
            force: true,
            ..fixture.options()
        },
        &agent,
        &probes,
        &host,
    )
    .expect("autofix");
    assert_eq!(forced.outcome, AutofixOutcome::DryRunComplete);
    assert!(forced.ok);
}

#[test]
fn dry_run_commits_locally_and_leaks_no_secret() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(Some("tool_calls rejected by provider"));
    let layout = RunLayout::new(&run_dir);
    let agent = fixing_agent();
    let probes = ScriptedProbes::new(
        probe_output(
            0,
            json!({"ok": true, "stage": "a", "response_preview": format!("key is {SECRET}")}),
        ),
        probe_output(0, json!({"ok": true, "stage": "b", "tool_invoked": true})),
    );
    let host = RecordingPrHost::new(PR_URL, "octo");

    let report = run_autofix(
        &fixture.env,
        &run_dir,
        &fixture.options(),
        &agent,
        &probes,
        &host,
    )
    .expect("autofix");

    assert_eq!(report.outcome, AutofixOutcome::DryRunComplete);
    assert_eq!(report.state, Some(AutofixState::DryRunComplete));
    assert!(host.requests().is_empty());
    let changes = report.changes.expect("changes");
    assert_eq!(changes.paths, vec!["openhands/sdk/llm/fix.py".to_string()]);
    assert_eq!(
        changes.skipped_ephemeral,
        vec!["openhands/sdk/llm/__pycache__/fix.cpython-312.pyc".to_string()]
    );

    let worktree = layout.artifact(WORKTREE_DIR);
    assert!(
        probes
            .requests()
            .iter()
            .all(|request| request.project_dir == worktree
                && request.script.ends_with("autofix_repro.py"))
    );

    let dry_run = read_json(&layout.artifact("autofix_upstream_pr_dry_run.json"));
    assert_eq!(dry_run["url"], Value::Null);
    assert_eq!(dry_run["commit"], json!(report.commit.expect("commit")));
    assert!(!layout.artifact("autofix_upstream_pr.json").exists());

    // Guaranteed cleanup.
    assert!(!worktree.exists());
    let record = load_worktree_record(&layout.artifact(WORKTREE_JSON)).expect("record");
    assert!(record.worktree.cleaned_up);
    assert!(
        !fixture
            .sdk
            .branch_exists(&record.worktree.branch)
            .expect("branch check")
    );

    // Secret canary.
    for path in files_under(&run_dir) {
        let bytes = fs::read(&path).expect("read artifact");
        assert!(
            !String::from_utf8_lossy(&bytes).contains(SECRET),
            "secret leaked into {}",
            path.display()
        );
    }
    let log = fs::read_to_string(&layout.log_file).expect("log");
    assert!(log.contains("autofix: committed"));
    assert!(log.contains("autofix: worktree cleaned up"));
}

#[test]
fn opens_pr_once_and_reentry_does_not_call_host() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(Some("tool_calls rejected by provider"));
    let fork = tempfile::tempdir().expect("fork dir");
    init_bare_repo(fork.path()).expect("bare repo");
    let agent = fixing_agent();
    let probes = ScriptedProbes::passing();
    let host = RecordingPrHost::new(PR_URL, "octo");
    let options = AutofixOptions {
        dry_run: false,
        fork: ForkTarget {
            owner: None,
            url: Some(fork.path().display().to_string()),
            remote: "oh-llm-fork".to_string(),
        },
        ..fixture.options()
    };

    let first = run_autofix(&fixture.env, &run_dir, &options, &agent, &probes, &host)
        .expect("autofix");

    assert_eq!(
        first.outcome,
        AutofixOutcome::PrOpened {
            url: PR_URL.to_string()
        }
    );
    let branch = first.branch.clone().expect("branch");
    let requests = host.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].head, format!("octo:{branch}"));
    assert_eq!(requests[0].repo, "OpenHands/software-agent-sdk");
    assert_eq!(
        requests[0].title,
        format!("oh-llm autofix: acme (acme/model-1) run {}", first.run_id)
    );
    let pushed = run_git(
        fork.path(),
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )
    .expect("pushed branch");
    assert_eq!(pushed.trim(), first.commit.as_deref().expect("commit"));
    let body = fs::read_to_string(RunLayout::new(&run_dir).artifact("autofix_upstream_pr_body.md"))
        .expect("body");
    assert!(body.contains("fix.py"));

    let second = run_autofix(&fixture.env, &run_dir, &options, &agent, &probes, &host)
        .expect("autofix again");
    assert_eq!(
        second.outcome,
        AutofixOutcome::AlreadyOpened {
            url: PR_URL.to_string()
        }
    );
    assert!(second.ok);
    assert_eq!(host.requests().len(), 1);
    assert_eq!(agent.calls(), 1);
}

#[test]
fn validation_failure_commits_nothing_and_cleans_up() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(Some("tool_calls rejected by provider"));
    let layout = RunLayout::new(&run_dir);
    let host = RecordingPrHost::new(PR_URL, "octo");

    let report = run_autofix(
        &fixture.env,
        &run_dir,
        &fixture.options(),
        &fixing_agent(),
        &failing_stage_b(),
        &host,
    )
    .expect("autofix");

    assert_eq!(report.outcome, AutofixOutcome::ValidationFailed);
    assert_eq!(report.state, Some(AutofixState::Validated));
    assert!(report.commit.is_none());
    let validation = read_json(&layout.artifact("autofix_validation.json"));
    assert_eq!(validation["ok"], json!(false));
    assert_eq!(validation["stage_a"]["ok"], json!(true));
    assert!(!layout.artifact("autofix_upstream_pr_dry_run.json").exists());
    assert!(!layout.artifact(WORKTREE_DIR).exists());
    let record = load_worktree_record(&layout.artifact(WORKTREE_JSON)).expect("record");
    assert!(record.worktree.cleaned_up);
}

#[test]
fn agent_without_edits_reports_no_changes() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(Some("tool_calls rejected by provider"));

    let report = run_autofix(
        &fixture.env,
        &run_dir,
        &fixture.options(),
        &ScriptedAgent::new(&[]),
        &ScriptedProbes::passing(),
        &RecordingPrHost::new(PR_URL, "octo"),
    )
    .expect("autofix");

    assert_eq!(report.outcome, AutofixOutcome::NoChanges);
    assert!(!report.ok);
}

#[test]
fn kept_worktree_resumes_without_rerunning_agent() {
    let fixture = Fixture::new();
    let run_dir = fixture.run_with(Some("tool_calls rejected by provider"));
    let layout = RunLayout::new(&run_dir);
    let agent = fixing_agent();
    let probes = ScriptedProbes::passing();
    let host = RecordingPrHost::new(PR_URL, "octo");
    let options = AutofixOptions {
        keep_worktree: true,
        ..fixture.options()
    };

    let first = run_autofix(&fixture.env, &run_dir, &options, &agent, &probes, &host)
        .expect("first");
    assert_eq!(first.outcome, AutofixOutcome::DryRunComplete);
    assert!(layout.artifact(WORKTREE_DIR).is_dir());

    let second = run_autofix(&fixture.env, &run_dir, &options, &agent, &probes, &host)
        .expect("second");
    assert_eq!(second.outcome, AutofixOutcome::DryRunComplete);
    assert_eq!(second.commit, first.commit);
    assert_eq!(agent.calls(), 1);
    assert_eq!(probes.requests().len(), 2);
    let record = load_worktree_record(&layout.artifact(WORKTREE_JSON)).expect("record");
    assert!(!record.worktree.cleaned_up);
}

#[test]
fn dirty_checkout_is_refused_before_worktree_creation() {
    let fixture = Fixture::new();
    fixture
        .sdk
        .write_file("scratch.txt", "uncommitted\n")
        .expect("dirty");
    let run_dir = fixture.run_with(Some("tool_calls rejected by provider"));
    let agent = fixing_agent();

    let err = run_autofix(
        &fixture.env,
        &run_dir,
        &fixture.options(),
        &agent,
        &ScriptedProbes::passing(),
        &RecordingPrHost::new(PR_URL, "octo"),
    )
    .expect_err("dirty base");

    assert!(
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::DirtyBase(_))))
    );
    assert_eq!(agent.calls(), 0);
    assert!(!RunLayout::new(&run_dir).artifact(WORKTREE_DIR).exists());
}
