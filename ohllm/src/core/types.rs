//! Run record types shared by the ledger, classifier and orchestration.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RUN_SCHEMA_VERSION: u32 = 1;

/// Probe stages in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKey {
    A,
    B,
    C,
}

impl StageKey {
    pub const ALL: [StageKey; 3] = [StageKey::A, StageKey::B, StageKey::C];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKey::A => "A",
            StageKey::B => "B",
            StageKey::C => "C",
        }
    }

    /// Human description stored in fresh run records.
    pub fn title(self) -> &'static str {
        match self {
            StageKey::A => "connectivity + basic completion",
            StageKey::B => "end-to-end agent run (tool calling)",
            StageKey::C => "optional advanced gates",
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotRun,
    Pass,
    Fail,
    /// Any status string this version does not know.
    #[serde(other)]
    Unknown,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::NotRun => "not_run",
            StageStatus::Pass => "pass",
            StageStatus::Fail => "fail",
            StageStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Operator-fixable: credentials, model name, base URL, connectivity.
    CredentialOrConfig,
    /// Probably a defect in the agent runtime or the provider integration.
    #[serde(alias = "sdk_bug")]
    SdkOrProviderBug,
    #[serde(other)]
    Unknown,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::CredentialOrConfig => "credential_or_config",
            Classification::SdkOrProviderBug => "sdk_or_provider_bug",
            Classification::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details attached to a failed stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageError {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl StageRecord {
    pub fn not_run(key: StageKey) -> Self {
        Self {
            name: key.title().to_string(),
            ..Self::default()
        }
    }
}

/// First failing stage, with its classification and operator hint.
///
/// Records written by older tools may omit the stage or the classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Failure {
    pub classification: Option<Classification>,
    pub stage: Option<StageKey>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
    pub hint: Option<String>,
}

/// Provider settings resolved at run time. Holds variable names, never values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedProfile {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDescriptor {
    pub name: String,
    /// Environment variable names whose values must be redacted from artifacts.
    pub redact_env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedProfile>,
}

/// Options the run was started with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub stage_b: bool,
    pub mock: bool,
    pub stage_a_timeout_secs: u64,
    pub stage_b_timeout_secs: u64,
}

/// Snapshot of the agent runtime checkout the run was evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkSnapshot {
    pub path: String,
    pub git_sha: Option<String>,
    pub git_dirty: Option<bool>,
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub profile: ProfileDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<RunRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_sdk: Option<SdkSnapshot>,
    #[serde(default)]
    pub stages: BTreeMap<StageKey, StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

fn default_schema_version() -> u32 {
    RUN_SCHEMA_VERSION
}

impl RunRecord {
    /// Fresh record with every stage `not_run`.
    pub fn new(run_id: &str, created_at: &str, profile: ProfileDescriptor) -> Self {
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            created_at: created_at.to_string(),
            profile,
            requested: None,
            agent_sdk: None,
            stages: StageKey::ALL
                .iter()
                .map(|key| (*key, StageRecord::not_run(*key)))
                .collect(),
            failure: None,
        }
    }

    pub fn stage(&self, key: StageKey) -> Option<&StageRecord> {
        self.stages.get(&key)
    }

    pub fn set_stage(&mut self, key: StageKey, record: StageRecord) {
        self.stages.insert(key, record);
    }

    /// Recompute `failure` from stage state. Called on every persist.
    pub fn sync_failure(&mut self) {
        self.failure = crate::core::failure::failure_from_stages(&self.stages);
    }

    pub fn has_failed_stage(&self) -> bool {
        self.stages
            .values()
            .any(|stage| stage.status == StageStatus::Fail)
    }
}
