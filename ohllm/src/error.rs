//! Typed failures that the CLI boundary must tell apart.
//!
//! Library functions return `anyhow::Result`; the variants below travel inside
//! `anyhow::Error` and are recovered with `downcast_ref` where the exit code or
//! the JSON `error` field depends on them.

use std::path::PathBuf;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Missing or invalid configuration (profile, API key variable, binaries).
    #[error("{0}")]
    Config(String),

    /// User input rejected before any side effect.
    #[error("{0}")]
    InvalidInput(String),

    /// An external command exited unsuccessfully.
    #[error("{command} failed: {output}")]
    ExternalProcess { command: String, output: String },

    /// Probe output could not be interpreted.
    #[error("{0}")]
    Probe(String),

    #[error("no run matches '{0}'")]
    RunNotFound(String),

    #[error("run reference '{reference}' is ambiguous: {}", .candidates.join(", "))]
    RunAmbiguous {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("run record missing: {}", .0.display())]
    MissingRunRecord(PathBuf),

    #[error("run record corrupt: {}: {reason}", .path.display())]
    CorruptRunRecord { path: PathBuf, reason: String },

    /// The base checkout has uncommitted changes and dirty checkouts were not allowed.
    #[error("agent SDK checkout is dirty: {}", .0.display())]
    DirtyBase(PathBuf),

    /// Publishing needs a passing `autofix_validation.json` first.
    #[error("{0}")]
    MissingValidation(String),
}

impl Error {
    /// Stable machine-readable code used in JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::InvalidInput(_) => "invalid_input",
            Error::ExternalProcess { .. } => "external_process_failed",
            Error::Probe(_) => "probe_error",
            Error::RunNotFound(_) => "run_not_found",
            Error::RunAmbiguous { .. } => "run_ambiguous",
            Error::MissingRunRecord(_) => "missing_run_record",
            Error::CorruptRunRecord { .. } => "corrupt_run_record",
            Error::DirtyBase(_) => "dirty_sdk",
            Error::MissingValidation(_) => "missing_validation",
        }
    }
}
