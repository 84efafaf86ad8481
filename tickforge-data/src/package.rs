//! Packaging of serialized checkpoints into compressed output archives,
//! one zip per (reference date, underlying).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::checkpoint::CheckpointStore;
use crate::config::ConverterConfig;

/// Entry name to its rendered lines, in fold (flush) order.
type ArchivePlan = BTreeMap<String, Vec<String>>;

/// Outcome of one packaging pass. A non-empty failure list must surface as
/// a non-zero process exit even though other archives were written.
#[derive(Debug, Default)]
pub struct PackageSummary {
    pub archives_written: usize,
    pub entries_written: usize,
    pub failures: Vec<PackageFailure>,
}

#[derive(Debug)]
pub struct PackageFailure {
    pub subject: String,
    pub reason: String,
}

/// Fold every checkpoint file into per-archive plans, then write the
/// archives with bounded parallelism. Independent archives proceed in
/// parallel; each archive is written by exactly one worker.
pub async fn package_all(config: &ConverterConfig) -> Result<PackageSummary> {
    let store = CheckpointStore::new(&config.checkpoint_dir);
    let files = store.list(config.reference_date)?;
    let mut summary = PackageSummary::default();
    if files.is_empty() {
        info!("no checkpoint files found; nothing to package");
        return Ok(summary);
    }

    let mut plans: BTreeMap<PathBuf, ArchivePlan> = BTreeMap::new();
    for path in &files {
        let checkpoint = match store.read(path) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(path = %path.display(), error = %err, "skipping unreadable checkpoint");
                summary.failures.push(PackageFailure {
                    subject: path.display().to_string(),
                    reason: err.to_string(),
                });
                continue;
            }
        };
        for snapshot in checkpoint.snapshots {
            plans
                .entry(config.destination_dir.join(&snapshot.archive_path))
                .or_default()
                .entry(snapshot.entry_name)
                .or_default()
                .extend(snapshot.lines);
        }
    }
    info!(
        checkpoints = files.len(),
        archives = plans.len(),
        "packaging checkpointed data"
    );

    let semaphore = Arc::new(Semaphore::new(config.settings.package_workers.max(1)));
    let mut tasks = JoinSet::new();
    for (path, entries) in plans {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("package semaphore closed")?;
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let entry_count = entries.len();
            let result = write_archive(&path, &entries);
            (path, entry_count, result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (path, entry_count, result) = joined.context("packaging task panicked")?;
        match result {
            Ok(()) => {
                summary.archives_written += 1;
                summary.entries_written += entry_count;
                info!(archive = %path.display(), entries = entry_count, "archive written");
            }
            Err(err) => {
                error!(archive = %path.display(), error = %err, "failed to write archive");
                summary.failures.push(PackageFailure {
                    subject: path.display().to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    if summary.failures.is_empty() && !config.settings.keep_checkpoints {
        let removed = store.purge(config.reference_date)?;
        debug!(removed, "checkpoint files removed after packaging");
    }
    Ok(summary)
}

/// Write one archive atomically: complete the temp file, then publish via
/// rename so a partially written archive is never visible.
fn write_archive(path: &Path, entries: &ArchivePlan) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let staging = path.with_extension("zip.tmp");
    let file = File::create(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (entry, lines) in entries {
        writer
            .start_file(entry.as_str(), options)
            .with_context(|| format!("failed to start entry {entry}"))?;
        for line in lines {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
    }
    writer
        .finish()
        .with_context(|| format!("failed to finalize {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to publish {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;
    use zip::ZipArchive;

    fn plan(entries: &[(&str, &[&str])]) -> ArchivePlan {
        entries
            .iter()
            .map(|(name, lines)| {
                (
                    name.to_string(),
                    lines.iter().map(ToString::to_string).collect(),
                )
            })
            .collect()
    }

    fn entry_lines(path: &Path, entry: &str) -> Vec<String> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name(entry)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content.lines().map(ToString::to_string).collect()
    }

    #[test]
    fn archives_publish_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aapl").join("20151224_ticks.zip");
        write_archive(
            &path,
            &plan(&[
                ("20151224_aapl_tick_trade.csv", &["1,2,3", "4,5,6"]),
                ("20151224_aapl_tick_quote.csv", &["7,8,9,10,11"]),
            ]),
        )
        .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("zip.tmp").exists(), "staging file left behind");
        assert_eq!(
            entry_lines(&path, "20151224_aapl_tick_trade.csv"),
            vec!["1,2,3", "4,5,6"]
        );
        assert_eq!(
            entry_lines(&path, "20151224_aapl_tick_quote.csv"),
            vec!["7,8,9,10,11"]
        );
    }

    #[test]
    fn rewriting_an_archive_replaces_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("20151224_ticks.zip");
        write_archive(&path, &plan(&[("a.csv", &["old"])])).unwrap();
        write_archive(&path, &plan(&[("a.csv", &["new"])])).unwrap();
        assert_eq!(entry_lines(&path, "a.csv"), vec!["new"]);
    }
}
