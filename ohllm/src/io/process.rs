//! Helpers for running child processes without pipe deadlocks.
//!
//! Nothing here enforces a timeout: long-running probes and agents carry their
//! own advisory limits, and the caller's process supervisor owns cancellation.

use std::ffi::OsStr;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::core::redaction::Redactor;
use crate::env::Env;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Serializable record of one external command, as stored in validation artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn from_output(command: Vec<String>, output: &CommandOutput) -> Self {
        Self {
            command,
            exit_code: output.status.code(),
            duration_ms: output.duration_ms,
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Render a command line for logs and artifacts.
pub fn describe_command(cmd: &Command) -> Vec<String> {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect()
}

/// Run a command and capture stdout/stderr, reading both pipes concurrently.
#[instrument(skip_all, fields(program = ?cmd.get_program()))]
pub fn run_captured(mut cmd: Command) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", describe_command(&cmd).join(" ")));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_all(stdout));
    let stderr_handle = thread::spawn(move || read_all(stderr));

    let status = child.wait().context("wait for command")?;
    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;
    let duration_ms = elapsed_ms(started);

    debug!(exit_code = ?status.code(), duration_ms, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        duration_ms,
    })
}

/// Run a command, streaming stdout and stderr line by line into `transcript_path`.
///
/// Every line passes through `redactor` before it reaches the file, and the
/// file is flushed after each line so the transcript can be tailed live.
/// `header` lines are written (redacted) before the child starts; an
/// `exit_code=` trailer is appended once it finishes.
#[instrument(skip_all, fields(program = ?cmd.get_program(), transcript = %transcript_path.display()))]
pub fn run_streaming_redacted(
    mut cmd: Command,
    transcript_path: &Path,
    header: &[String],
    redactor: &Redactor,
) -> Result<ExitStatus> {
    if let Some(parent) = transcript_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create transcript dir {}", parent.display()))?;
    }
    let file = fs::File::create(transcript_path)
        .with_context(|| format!("create transcript {}", transcript_path.display()))?;
    let writer = Arc::new(Mutex::new(BufWriter::new(file)));
    {
        let mut guard = lock_transcript(&*writer);
        for line in header {
            writeln!(guard, "{}", redactor.redact_text(line)).context("write transcript header")?;
        }
        guard.flush().context("flush transcript header")?;
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!("spawning streamed child process");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", describe_command(&cmd).join(" ")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = {
        let writer = Arc::clone(&writer);
        let redactor = redactor.clone();
        thread::spawn(move || tee_lines(stdout, &writer, &redactor))
    };
    let stderr_handle = {
        let writer = Arc::clone(&writer);
        let redactor = redactor.clone();
        thread::spawn(move || tee_lines(stderr, &writer, &redactor))
    };

    let status = child.wait().context("wait for command")?;
    join_reader(stdout_handle).context("join stdout")?;
    join_reader(stderr_handle).context("join stderr")?;

    let mut guard = lock_transcript(&*writer);
    let code = status
        .code()
        .map_or_else(|| "signal".to_string(), |code| code.to_string());
    writeln!(guard, "\nexit_code={code}").context("write transcript trailer")?;
    guard.flush().context("flush transcript")?;

    debug!(exit_code = ?status.code(), "streamed command finished");
    Ok(status)
}

/// Locate an executable: values containing a path separator are taken as-is,
/// bare names are searched on `PATH`.
pub fn find_executable(env: &dyn Env, name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || name.contains(std::path::MAIN_SEPARATOR) {
        return Some(candidate.to_path_buf());
    }
    let path_var = env.var("PATH")?;
    std::env::split_paths(OsStr::new(&path_var))
        .map(|dir| dir.join(name))
        .find(|full| full.is_file())
}

fn tee_lines<R: Read>(
    reader: R,
    writer: &Mutex<BufWriter<fs::File>>,
    redactor: &Redactor,
) -> Result<()> {
    let mut buf_reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let redacted = redactor.redact_text(&text);
        let mut guard = lock_transcript(writer);
        if let Err(e) = guard.write_all(redacted.as_bytes()) {
            warn!(err = %e, "failed to write transcript line");
        } else if let Err(e) = guard.flush() {
            warn!(err = %e, "failed to flush transcript");
        }
    }
    Ok(())
}

/// Lock the transcript writer, recovering it if another reader thread panicked.
///
/// Every write is a whole line, so a poisoned writer still holds a usable file.
fn lock_transcript<W>(writer: &Mutex<W>) -> MutexGuard<'_, W> {
    writer.lock().unwrap_or_else(|poisoned| {
        warn!("transcript writer poisoned; continuing");
        PoisonError::into_inner(poisoned)
    })
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("read output")?;
    Ok(buf)
}

fn join_reader<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
