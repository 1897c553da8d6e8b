//! Failure classification for failed stages.
//!
//! Classification decides whether autofix may run: anything an operator can fix
//! by editing a profile or the network setup is `credential_or_config` and is
//! never sent to the coding agent.

use std::collections::BTreeMap;

use crate::core::types::{Classification, Failure, StageKey, StageRecord, StageStatus};

const CREDENTIAL_MARKERS: [&str; 11] = [
    "unauthorized",
    "invalid api key",
    "api key invalid",
    "incorrect api key",
    "missing api key",
    "no api key",
    "api key env var not set",
    "authentication",
    "forbidden",
    "401",
    "403",
];
const CREDENTIAL_HINT: &str = "Check your API key env var and provider credentials.";

const MODEL_MARKERS: [&str; 4] = ["model_not_found", "no such model", "does not exist", "404"];
const MODEL_HINT: &str = "Check that the model name is correct.";

const NETWORK_MARKERS: [&str; 7] = [
    "api connection error",
    "connection refused",
    "name or service not known",
    "nodename nor servname provided",
    "timed out",
    "timeout",
    "ssl",
];
const NETWORK_HINT: &str = "Check base_url/network connectivity and timeout.";

const DEFAULT_HINT: &str = "Likely SDK/provider incompatibility; inspect run artifacts/logs.";

/// Classify an error by its type name and message.
///
/// Marker sets are checked in priority order: credential, model, network.
pub fn classify(kind: Option<&str>, message: Option<&str>) -> (Classification, &'static str) {
    let haystack = format!("{}: {}", kind.unwrap_or(""), message.unwrap_or("")).to_lowercase();
    let groups: [(&[&str], &'static str); 3] = [
        (&CREDENTIAL_MARKERS, CREDENTIAL_HINT),
        (&MODEL_MARKERS, MODEL_HINT),
        (&NETWORK_MARKERS, NETWORK_HINT),
    ];
    for (markers, hint) in groups {
        if markers.iter().any(|marker| haystack.contains(marker)) {
            return (Classification::CredentialOrConfig, hint);
        }
    }
    (Classification::SdkOrProviderBug, DEFAULT_HINT)
}

/// First failing stage in A, B, C order, or `None` when nothing failed.
///
/// A classification already recorded on the stage error wins over the computed
/// one. The computed hint is only filled in when the classification was
/// computed too; a recorded classification keeps whatever hint was recorded.
pub fn failure_from_stages(stages: &BTreeMap<StageKey, StageRecord>) -> Option<Failure> {
    StageKey::ALL.iter().find_map(|key| {
        let stage = stages.get(key)?;
        if stage.status != StageStatus::Fail {
            return None;
        }
        let error = stage.error.clone().unwrap_or_default();
        let (classification, hint) = match error.classification {
            Some(recorded) => (recorded, error.hint),
            None => {
                let (computed, auto_hint) =
                    classify(error.kind.as_deref(), error.message.as_deref());
                (computed, error.hint.or_else(|| Some(auto_hint.to_string())))
            }
        };
        Some(Failure {
            classification: Some(classification),
            stage: Some(*key),
            kind: error.kind,
            message: error.message,
            hint,
        })
    })
}

/// Classification of a recorded failure, computed from its type and message
/// when the record carries none.
pub fn effective_classification(failure: &Failure) -> Classification {
    failure.classification.unwrap_or_else(|| {
        classify(failure.kind.as_deref(), failure.message.as_deref()).0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageError;

    fn failed(kind: &str, message: &str) -> StageRecord {
        StageRecord {
            status: StageStatus::Fail,
            error: Some(StageError {
                kind: Some(kind.to_string()),
                message: Some(message.to_string()),
                ..StageError::default()
            }),
            ..StageRecord::default()
        }
    }

    #[test]
    fn credential_markers_take_priority() {
        let (class, hint) = classify(Some("AuthenticationError"), Some("404 model missing"));
        assert_eq!(class, Classification::CredentialOrConfig);
        assert_eq!(hint, CREDENTIAL_HINT);
    }

    #[test]
    fn model_and_network_markers_are_operator_fixable() {
        assert_eq!(
            classify(None, Some("Model does not exist")),
            (Classification::CredentialOrConfig, MODEL_HINT)
        );
        assert_eq!(
            classify(Some("APIConnectionError"), Some("Request timed out")),
            (Classification::CredentialOrConfig, NETWORK_HINT)
        );
    }

    #[test]
    fn unknown_errors_are_sdk_bugs() {
        assert_eq!(
            classify(Some("KeyError"), Some("'tool_calls'")),
            (Classification::SdkOrProviderBug, DEFAULT_HINT)
        );
        assert_eq!(
            classify(None, None),
            (Classification::SdkOrProviderBug, DEFAULT_HINT)
        );
    }

    #[test]
    fn first_failing_stage_wins() {
        let mut stages = BTreeMap::new();
        stages.insert(StageKey::A, StageRecord { status: StageStatus::Pass, ..StageRecord::default() });
        stages.insert(StageKey::B, failed("ProbeError", "tool never observed"));
        stages.insert(StageKey::C, failed("AuthenticationError", "401"));

        let failure = failure_from_stages(&stages).expect("failure");
        assert_eq!(failure.stage, Some(StageKey::B));
        assert_eq!(failure.classification, Some(Classification::SdkOrProviderBug));
        assert_eq!(failure.hint.as_deref(), Some(DEFAULT_HINT));
    }

    #[test]
    fn recorded_classification_and_hint_are_kept() {
        let mut stage = failed("ProbeError", "401 unauthorized");
        if let Some(error) = stage.error.as_mut() {
            error.classification = Some(Classification::SdkOrProviderBug);
            error.hint = Some("custom".to_string());
        }
        let stages = BTreeMap::from([(StageKey::A, stage)]);

        let failure = failure_from_stages(&stages).expect("failure");
        assert_eq!(failure.classification, Some(Classification::SdkOrProviderBug));
        assert_eq!(failure.hint.as_deref(), Some("custom"));
    }

    #[test]
    fn recorded_classification_without_hint_stays_without_hint() {
        let mut stage = failed("ProbeError", "401 unauthorized");
        if let Some(error) = stage.error.as_mut() {
            error.classification = Some(Classification::SdkOrProviderBug);
        }
        let stages = BTreeMap::from([(StageKey::A, stage)]);

        let failure = failure_from_stages(&stages).expect("failure");
        assert_eq!(failure.classification, Some(Classification::SdkOrProviderBug));
        assert_eq!(failure.hint, None);
    }

    #[test]
    fn missing_classification_is_computed_from_message() {
        let failure = Failure {
            message: Some("Incorrect API key provided".to_string()),
            ..Failure::default()
        };
        assert_eq!(
            effective_classification(&failure),
            Classification::CredentialOrConfig
        );
        let recorded = Failure {
            classification: Some(Classification::SdkOrProviderBug),
            ..failure
        };
        assert_eq!(
            effective_classification(&recorded),
            Classification::SdkOrProviderBug
        );
    }

    #[test]
    fn no_failure_when_nothing_failed() {
        let stages = BTreeMap::from([
            (StageKey::A, StageRecord { status: StageStatus::Pass, ..StageRecord::default() }),
            (StageKey::B, StageRecord::default()),
        ]);
        assert!(failure_from_stages(&stages).is_none());
    }
}
