//! Change selection: which worktree paths belong in an autofix commit.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Directory names that only ever hold caches or virtualenvs.
const EPHEMERAL_SEGMENTS: [&str; 7] = [
    ".venv",
    "venv",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".cache",
    "__pycache__",
];
const EPHEMERAL_SUFFIXES: [&str; 2] = [".pyc", ".pyo"];
const EPHEMERAL_FILES: [&str; 1] = [".DS_Store"];

static RENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^..\s+(?P<old>.+?)\s+->\s+(?P<new>.+)$").expect("rename pattern should compile")
});

/// Paths to commit versus paths left out as ephemeral. Both sorted and unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSelection {
    pub paths: Vec<String>,
    pub skipped_ephemeral: Vec<String>,
}

impl ChangeSelection {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Every path mentioned by `git status --porcelain=v1`, renames contributing both sides.
pub fn porcelain_paths(porcelain: &str) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for line in porcelain.lines() {
        if line.trim().is_empty() || line.len() < 4 {
            continue;
        }
        if let Some(caps) = RENAME_RE.captures(line) {
            for side in ["old", "new"] {
                if let Some(found) = caps.name(side) {
                    paths.insert(normalize_path(found.as_str()));
                }
            }
            continue;
        }
        let Some(rest) = line.get(3..) else {
            continue;
        };
        paths.insert(normalize_path(rest));
    }
    paths.retain(|path| !path.is_empty());
    paths.into_iter().collect()
}

pub fn is_ephemeral(path: &str) -> bool {
    let trimmed = path.trim_end_matches('/');
    let mut segments = trimmed.split('/').filter(|segment| !segment.is_empty());
    if segments.any(|segment| EPHEMERAL_SEGMENTS.contains(&segment)) {
        return true;
    }
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    EPHEMERAL_FILES.contains(&last)
        || EPHEMERAL_SUFFIXES
            .iter()
            .any(|suffix| trimmed.ends_with(suffix))
}

/// Partition porcelain output into committable and ephemeral paths.
pub fn select_changes(porcelain: &str) -> ChangeSelection {
    let (skipped_ephemeral, paths): (Vec<String>, Vec<String>) = porcelain_paths(porcelain)
        .into_iter()
        .partition(|path| is_ephemeral(path));
    ChangeSelection {
        paths,
        skipped_ephemeral,
    }
}

fn normalize_path(raw: &str) -> String {
    let unquoted = raw.trim().trim_matches('"');
    unquoted
        .strip_prefix("./")
        .unwrap_or(unquoted)
        .to_string()
}
