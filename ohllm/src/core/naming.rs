//! Deterministic names derived from run identity.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

const RUN_SLUG_MAX_CHARS: usize = 40;
const BRANCH_RUN_ID_CHARS: usize = 16;

static BRANCH_SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").expect("branch slug pattern should compile"));

/// Slug used in run directory names.
///
/// Keeps alphanumerics, `-` and `_`, turns whitespace into `_`, drops the rest.
pub fn run_slug(value: &str) -> String {
    let mapped: String = value
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();
    let trimmed: String = mapped
        .trim_matches('_')
        .chars()
        .take(RUN_SLUG_MAX_CHARS)
        .collect();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed
    }
}

/// `<YYYYmmdd_HHMMSS>_<slug(profile)>_<run_id>`.
pub fn run_dir_name(now: DateTime<Utc>, profile: &str, run_id: &str) -> String {
    format!(
        "{}_{}_{}",
        now.format("%Y%m%d_%H%M%S"),
        run_slug(profile),
        run_id
    )
}

/// Lowercase slug safe for git ref names.
pub fn branch_slug(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let replaced = BRANCH_SLUG_RE.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Branch used for an autofix worktree. Pure function of its inputs.
pub fn derive_branch_name(profile: &str, run_id: &str) -> String {
    let run_part: String = branch_slug(run_id)
        .chars()
        .take(BRANCH_RUN_ID_CHARS)
        .collect();
    format!("oh-llm-autofix-{}-{}", branch_slug(profile), run_part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_slug_maps_whitespace_and_drops_symbols() {
        assert_eq!(run_slug(" my profile/v2 "), "my_profilev2");
        assert_eq!(run_slug("***"), "unknown");
        assert_eq!(run_slug(&"x".repeat(60)).len(), 40);
    }

    #[test]
    fn run_dir_name_embeds_timestamp_slug_and_id() {
        let now = Utc
            .with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
            .single()
            .expect("date");
        assert_eq!(
            run_dir_name(now, "openai gpt", "0123456789ab"),
            "20250102_030405_openai_gpt_0123456789ab"
        );
    }

    #[test]
    fn branch_name_is_deterministic_and_sanitized() {
        let first = derive_branch_name("My Profile!", "ABCDEF0123456789XYZ");
        let second = derive_branch_name("My Profile!", "ABCDEF0123456789XYZ");
        assert_eq!(first, second);
        assert_eq!(first, "oh-llm-autofix-my-profile-abcdef0123456789");
    }

    #[test]
    fn branch_slug_falls_back_to_unknown() {
        assert_eq!(branch_slug("///"), "unknown");
        assert_eq!(derive_branch_name("", ""), "oh-llm-autofix-unknown-unknown");
    }
}
