//! `runs export`: pack a run directory into a gzip tarball.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, instrument};

/// Directory names never exported (ephemeral checkouts).
const EXCLUDED_DIRS: [&str; 1] = ["autofix_sdk_worktree"];

/// Write `run_dir` to `output` with members rooted at the run directory name.
#[instrument(skip_all, fields(run_dir = %run_dir.display(), output = %output.display()))]
pub fn export_run(run_dir: &Path, output: &Path) -> Result<u64> {
    let root_name = run_dir
        .file_name()
        .with_context(|| format!("run dir has no name {}", run_dir.display()))?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = File::create(output).with_context(|| format!("create {}", output.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut count = 0;
    append_dir(&mut builder, run_dir, &PathBuf::from(root_name), &mut count)?;

    let encoder = builder.into_inner().context("finish tar stream")?;
    encoder.finish().context("finish gzip stream")?;
    debug!(files = count, "run exported");
    Ok(count)
}

fn append_dir(
    builder: &mut tar::Builder<GzEncoder<File>>,
    dir: &Path,
    name: &Path,
    count: &mut u64,
) -> Result<()> {
    builder
        .append_dir(name, dir)
        .with_context(|| format!("archive {}", dir.display()))?;
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("read entries in {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let member = name.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_dir() {
            if EXCLUDED_DIRS
                .iter()
                .any(|excluded| entry.file_name() == *excluded)
            {
                debug!(path = %path.display(), "skipping ephemeral directory");
                continue;
            }
            append_dir(builder, &path, &member, count)?;
        } else {
            builder
                .append_path_with_name(&path, &member)
                .with_context(|| format!("archive {}", path.display()))?;
            *count += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn members_are_rooted_at_run_name_and_skip_worktree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("20250101_000000_p_abc");
        fs::create_dir_all(run_dir.join("logs")).expect("mkdir");
        fs::create_dir_all(run_dir.join("artifacts/autofix_sdk_worktree")).expect("mkdir");
        fs::write(run_dir.join("run.json"), "{}").expect("write");
        fs::write(run_dir.join("logs/run.log"), "x").expect("write");
        fs::write(run_dir.join("artifacts/autofix_sdk_worktree/big.bin"), "x").expect("write");
        let output = temp.path().join("out/run.tar.gz");

        let count = export_run(&run_dir, &output).expect("export");
        assert_eq!(count, 2);

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&output).expect("open")));
        let names: Vec<String> = archive
            .entries()
            .expect("entries")
            .map(|entry| {
                entry
                    .expect("entry")
                    .path()
                    .expect("path")
                    .display()
                    .to_string()
            })
            .collect();
        assert!(names.contains(&"20250101_000000_p_abc/run.json".to_string()));
        assert!(names.contains(&"20250101_000000_p_abc/logs/run.log".to_string()));
        assert!(!names.iter().any(|name| name.contains("autofix_sdk_worktree")));
    }
}
