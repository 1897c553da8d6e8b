//! Run ledger: one directory per run under the runs root.
//!
//! ```text
//! <runs_dir>/<YYYYmmdd_HHMMSS>_<profile-slug>_<run_id>/
//!   run.json
//!   logs/run.log
//!   artifacts/
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::failure::{effective_classification, failure_from_stages};
use crate::core::naming::run_dir_name;
use crate::core::redaction::Redactor;
use crate::core::summary::{RunStatus, compute_status};
use crate::core::types::{Classification, RunRecord, StageKey, StageStatus};
use crate::env::{Env, timestamp};
use crate::error::Error;
use crate::io::artifacts::{PRIVATE_FILE_MODE, restrict_permissions, write_atomic};

const MAX_AMBIGUOUS_CANDIDATES: usize = 5;

/// Paths inside a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run_dir: PathBuf,
    pub run_json: PathBuf,
    pub logs_dir: PathBuf,
    pub log_file: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl RunLayout {
    pub fn new(run_dir: &Path) -> Self {
        let logs_dir = run_dir.join("logs");
        Self {
            run_dir: run_dir.to_path_buf(),
            run_json: run_dir.join("run.json"),
            log_file: logs_dir.join("run.log"),
            logs_dir,
            artifacts_dir: run_dir.join("artifacts"),
        }
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.artifacts_dir.join(name)
    }

    /// Final path component of the run directory.
    pub fn dir_name(&self) -> String {
        self.run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A freshly created run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub created_at: String,
    pub layout: RunLayout,
}

/// Listing row for `runs list` / `runs show`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub created_at: String,
    pub run_dir: PathBuf,
    pub profile_name: String,
    pub stages: BTreeMap<StageKey, StageStatus>,
    pub status: RunStatus,
    pub failure_classification: Option<Classification>,
}

/// Create a new run directory with `logs/` and `artifacts/`.
///
/// Fails if the directory already exists; there is no retry with a fresh id.
#[instrument(skip_all, fields(profile))]
pub fn create_run(env: &dyn Env, runs_dir: &Path, profile: &str) -> Result<NewRun> {
    let now = env.now();
    let run_id = env.new_run_id();
    let run_dir = runs_dir.join(run_dir_name(now, profile, &run_id));

    fs::create_dir_all(runs_dir)
        .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
    fs::create_dir(&run_dir).with_context(|| format!("create run dir {}", run_dir.display()))?;
    let layout = RunLayout::new(&run_dir);
    fs::create_dir_all(&layout.logs_dir)
        .with_context(|| format!("create {}", layout.logs_dir.display()))?;
    fs::create_dir_all(&layout.artifacts_dir)
        .with_context(|| format!("create {}", layout.artifacts_dir.display()))?;

    debug!(run_id = %run_id, run_dir = %run_dir.display(), "run created");
    Ok(NewRun {
        run_id,
        created_at: timestamp(now),
        layout,
    })
}

/// Append a timestamped, redacted line to a run log.
pub fn append_log(env: &dyn Env, path: &Path, message: &str, redactor: &Redactor) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let line = format!(
        "[{}] {}\n",
        timestamp(env.now()),
        redactor.redact_text(message)
    );
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append log {}", path.display()))?;
    Ok(())
}

/// Sync `failure` with stage state, then write the redacted record atomically.
pub fn write_run_record(path: &Path, record: &mut RunRecord, redactor: &Redactor) -> Result<()> {
    record.sync_failure();
    debug!(path = %path.display(), run_id = %record.run_id, failure = ?record.failure.as_ref().map(|f| f.stage), "writing run record");
    let payload = redactor
        .to_json(record)
        .with_context(|| format!("render run record {}", path.display()))?;
    write_atomic(path, &payload)?;
    restrict_permissions(path, PRIVATE_FILE_MODE);
    Ok(())
}

/// Read `run.json`, distinguishing a missing record from a corrupt one.
pub fn read_run_record(run_dir: &Path) -> Result<RunRecord> {
    let path = RunLayout::new(run_dir).run_json;
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::MissingRunRecord(path).into());
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&contents).map_err(|err| {
        Error::CorruptRunRecord {
            path,
            reason: err.to_string(),
        }
        .into()
    })
}

/// Run directories, newest first by name. A missing root yields nothing.
pub fn list_run_dirs(runs_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(runs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read runs dir {}", runs_dir.display()));
        }
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", runs_dir.display()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(dirs)
}

/// Resolve a user-supplied reference (directory name, run id, or a prefix of either).
///
/// Exact directory name beats exact run id beats a unique prefix. Anything
/// else is [`Error::RunAmbiguous`] or [`Error::RunNotFound`].
#[instrument(skip_all, fields(reference))]
pub fn resolve_run(runs_dir: &Path, reference: &str) -> Result<PathBuf> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(Error::RunNotFound("missing run reference".to_string()).into());
    }

    let mut candidates: Vec<(PathBuf, String, Option<String>)> = Vec::new();
    for dir in list_run_dirs(runs_dir)? {
        let name = dir_name(&dir);
        let run_id = peek_run_id(&dir);
        let name_hit = name == reference || name.starts_with(reference);
        let id_hit = run_id
            .as_deref()
            .is_some_and(|id| id == reference || id.starts_with(reference));
        if name_hit || id_hit {
            candidates.push((dir, name, run_id));
        }
    }

    let exact_name: Vec<_> = candidates
        .iter()
        .filter(|(_, name, _)| name == reference)
        .collect();
    if let [(dir, _, _)] = exact_name.as_slice() {
        return Ok(dir.clone());
    }
    let exact_id: Vec<_> = candidates
        .iter()
        .filter(|(_, _, id)| id.as_deref() == Some(reference))
        .collect();
    if let [(dir, _, _)] = exact_id.as_slice() {
        return Ok(dir.clone());
    }

    match candidates.len() {
        0 => Err(Error::RunNotFound(reference.to_string()).into()),
        1 => Ok(candidates.remove(0).0),
        _ => {
            warn!(count = candidates.len(), "ambiguous run reference");
            Err(Error::RunAmbiguous {
                reference: reference.to_string(),
                candidates: candidates
                    .into_iter()
                    .take(MAX_AMBIGUOUS_CANDIDATES)
                    .map(|(_, name, _)| name)
                    .collect(),
            }
            .into())
        }
    }
}

/// Newest run directory, if any.
pub fn latest_run(runs_dir: &Path) -> Result<PathBuf> {
    list_run_dirs(runs_dir)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::RunNotFound(format!("no runs in {}", runs_dir.display())).into())
}

pub fn summarize(run_dir: &Path) -> Result<RunSummary> {
    let record = read_run_record(run_dir)?;
    let stages: BTreeMap<StageKey, StageStatus> = record
        .stages
        .iter()
        .map(|(key, stage)| (*key, stage.status))
        .collect();
    let failure_classification = record
        .failure
        .as_ref()
        .map(effective_classification)
        .or_else(|| {
            failure_from_stages(&record.stages).and_then(|failure| failure.classification)
        });
    Ok(RunSummary {
        run_id: record.run_id,
        created_at: record.created_at,
        run_dir: run_dir.to_path_buf(),
        profile_name: record.profile.name,
        status: compute_status(&stages),
        stages,
        failure_classification,
    })
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Best-effort `run_id` lookup used during resolution; unreadable records match by name only.
fn peek_run_id(run_dir: &Path) -> Option<String> {
    let contents = fs::read_to_string(RunLayout::new(run_dir).run_json).ok()?;
    let value: Value = serde_json::from_str(&contents).ok()?;
    value
        .get("run_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ProfileDescriptor, StageError, StageRecord};
    use crate::test_support::FixedEnv;

    fn write_record(dir: &Path, run_id: &str) {
        fs::create_dir_all(dir).expect("mkdir");
        let mut record = RunRecord::new(run_id, "2025-01-01T00:00:00+00:00", ProfileDescriptor::default());
        write_run_record(&dir.join("run.json"), &mut record, &Redactor::default()).expect("write");
    }

    #[test]
    fn create_run_lays_out_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = FixedEnv::new().with_run_ids(["0123456789ab"]);
        let run = create_run(&env, temp.path(), "my profile").expect("create");

        assert_eq!(run.run_id, "0123456789ab");
        assert_eq!(run.layout.dir_name(), "20250102_030405_my_profile_0123456789ab");
        assert!(run.layout.logs_dir.is_dir());
        assert!(run.layout.artifacts_dir.is_dir());
        assert_eq!(run.created_at, "2025-01-02T03:04:05+00:00");
    }

    #[test]
    fn create_run_refuses_existing_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = FixedEnv::new().with_run_ids(["aaaaaaaaaaaa", "aaaaaaaaaaaa"]);
        create_run(&env, temp.path(), "p").expect("first");
        assert!(create_run(&env, temp.path(), "p").is_err());
    }

    #[test]
    fn append_log_is_timestamped_and_redacted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs/run.log");
        let env = FixedEnv::new();
        let redactor = Redactor::new(["pw-123456"]);
        append_log(&env, &path, "first pw-123456", &redactor).expect("append");
        append_log(&env, &path, "second", &redactor).expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(
            contents,
            "[2025-01-02T03:04:05+00:00] first <REDACTED>\n[2025-01-02T03:04:05+00:00] second\n"
        );
    }

    #[test]
    fn write_run_record_syncs_failure_and_redacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        let mut record = RunRecord::new("r1", "t", ProfileDescriptor::default());
        record.set_stage(
            StageKey::A,
            StageRecord {
                status: StageStatus::Fail,
                error: Some(StageError {
                    kind: Some("AuthenticationError".to_string()),
                    message: Some("401 for key live-secret-1".to_string()),
                    ..StageError::default()
                }),
                ..StageRecord::not_run(StageKey::A)
            },
        );

        write_run_record(&path, &mut record, &Redactor::new(["live-secret-1"])).expect("write");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("live-secret-1"));
        let loaded = read_run_record(temp.path()).expect("read");
        let failure = loaded.failure.expect("failure");
        assert_eq!(failure.classification, Some(Classification::CredentialOrConfig));
        assert_eq!(failure.stage, Some(StageKey::A));
    }

    #[test]
    fn missing_and_corrupt_records_are_distinct() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_run_record(temp.path()).expect_err("missing");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingRunRecord(_))));

        fs::write(temp.path().join("run.json"), "{not json").expect("write");
        let err = read_run_record(temp.path()).expect_err("corrupt");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::CorruptRunRecord { .. })));
    }

    #[test]
    fn list_is_newest_first_and_tolerates_missing_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(list_run_dirs(&temp.path().join("nope")).expect("list").is_empty());
        fs::create_dir(temp.path().join("20250101_000000_p_a")).expect("mkdir");
        fs::create_dir(temp.path().join("20250102_000000_p_b")).expect("mkdir");
        fs::write(temp.path().join("stray.txt"), "").expect("write");

        let names: Vec<String> = list_run_dirs(temp.path())
            .expect("list")
            .iter()
            .map(|dir| dir_name(dir))
            .collect();
        assert_eq!(names, vec!["20250102_000000_p_b", "20250101_000000_p_a"]);
    }

    #[test]
    fn resolve_by_name_id_and_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("20250101_000000_p_aaaaaaaaaaaa");
        let second = temp.path().join("20250102_000000_p_bbbbbbbbbbbb");
        write_record(&first, "aaaaaaaaaaaa");
        write_record(&second, "bbbbbbbbbbbb");

        assert_eq!(resolve_run(temp.path(), "20250101_000000_p_aaaaaaaaaaaa").expect("name"), first);
        assert_eq!(resolve_run(temp.path(), "bbbbbbbbbbbb").expect("id"), second);
        assert_eq!(resolve_run(temp.path(), "bbb").expect("id prefix"), second);
        assert_eq!(resolve_run(temp.path(), "20250101").expect("name prefix"), first);
    }

    #[test]
    fn resolve_reports_ambiguity_with_both_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_record(&temp.path().join("20250101_000000_p_aaaaaaaaaaaa"), "aaaaaaaaaaaa");
        write_record(&temp.path().join("20250102_000000_p_bbbbbbbbbbbb"), "bbbbbbbbbbbb");

        let err = resolve_run(temp.path(), "2025").expect_err("ambiguous");
        match err.downcast_ref::<Error>() {
            Some(Error::RunAmbiguous { candidates, .. }) => {
                assert_eq!(
                    candidates,
                    &vec![
                        "20250102_000000_p_bbbbbbbbbbbb".to_string(),
                        "20250101_000000_p_aaaaaaaaaaaa".to_string()
                    ]
                );
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn resolve_exact_name_beats_prefix_of_another() {
        let temp = tempfile::tempdir().expect("tempdir");
        let short = temp.path().join("run");
        let long = temp.path().join("run-2");
        write_record(&short, "111111111111");
        write_record(&long, "222222222222");
        assert_eq!(resolve_run(temp.path(), "run").expect("exact"), short);
    }

    #[test]
    fn resolve_reports_ambiguity_for_shared_run_id_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_record(&temp.path().join("x-run"), "abc111111111");
        write_record(&temp.path().join("y-run"), "abc222222222");

        let err = resolve_run(temp.path(), "abc").expect_err("ambiguous");
        match err.downcast_ref::<Error>() {
            Some(Error::RunAmbiguous {
                reference,
                candidates,
            }) => {
                assert_eq!(reference, "abc");
                assert_eq!(candidates, &vec!["y-run".to_string(), "x-run".to_string()]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
        assert_eq!(
            resolve_run(temp.path(), "abc1").expect("unique id prefix"),
            temp.path().join("x-run")
        );
    }

    #[test]
    fn resolve_exact_run_id_beats_prefix_of_another() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exact = temp.path().join("first");
        let longer = temp.path().join("second");
        write_record(&exact, "abc123");
        write_record(&longer, "abc123456789");
        assert_eq!(resolve_run(temp.path(), "abc123").expect("exact id"), exact);
    }

    #[test]
    fn resolve_not_found_and_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        for reference in ["zzz", "  "] {
            let err = resolve_run(temp.path(), reference).expect_err("not found");
            assert!(matches!(err.downcast_ref::<Error>(), Some(Error::RunNotFound(_))));
        }
    }

    #[test]
    fn summarize_computes_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("r");
        write_record(&dir, "r1");
        let summary = summarize(&dir).expect("summary");
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.failure_classification, None);
        assert_eq!(summary.stages.len(), 3);
    }

    #[test]
    fn summarize_tolerates_unrecognized_status_and_sparse_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("r");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(
            dir.join("run.json"),
            r#"{
                "run_id": "r1",
                "stages": {"A": {"status": "pass"}, "B": {"status": "skipped"}},
                "failure": {"classification": "sdk_bug", "summary": "boom"}
            }"#,
        )
        .expect("write");

        let summary = summarize(&dir).expect("summary");
        assert_eq!(summary.status, RunStatus::Unknown);
        assert_eq!(summary.stages[&StageKey::B], StageStatus::Unknown);
        assert_eq!(
            summary.failure_classification,
            Some(Classification::SdkOrProviderBug)
        );
    }
}
