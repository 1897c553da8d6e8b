//! Overall run status derived from per-stage statuses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{StageKey, StageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pass,
    Fail,
    Partial,
    Unknown,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pass => "pass",
            RunStatus::Fail => "fail",
            RunStatus::Partial => "partial",
            RunStatus::Unknown => "unknown",
        }
    }
}

/// `fail` beats `unknown` beats `partial` beats `pass`.
///
/// No stages at all, or any unrecognized stage status, is `unknown`.
pub fn compute_status(stages: &BTreeMap<StageKey, StageStatus>) -> RunStatus {
    if stages.is_empty() {
        return RunStatus::Unknown;
    }
    if stages.values().any(|status| *status == StageStatus::Fail) {
        return RunStatus::Fail;
    }
    if stages.values().any(|status| *status == StageStatus::Unknown) {
        return RunStatus::Unknown;
    }
    if stages.values().any(|status| *status == StageStatus::NotRun) {
        return RunStatus::Partial;
    }
    RunStatus::Pass
}
