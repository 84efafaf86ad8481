//! Periodic durable checkpoints of buffered processor state, and the
//! scheduler that cuts them as the merged stream's clock advances.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::processor::{ProcessorRegistry, ProcessorSnapshot};

/// On-disk form of one flush: everything packaging needs to proceed
/// independently of the ingestion process.
#[derive(Debug, Deserialize, Serialize)]
pub struct CheckpointFile {
    pub reference_date: NaiveDate,
    pub sequence: u32,
    pub cutoff: DateTime<Utc>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub snapshots: Vec<ProcessorSnapshot>,
}

/// Directory of checkpoint files for conversion runs, one file per flush,
/// named so lexicographic order is flush order.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(date: NaiveDate, sequence: u32) -> String {
        format!("{}-{sequence:04}.ckpt.json", date.format("%Y%m%d"))
    }

    fn belongs_to(date: NaiveDate, name: &str) -> bool {
        name.starts_with(&format!("{}-", date.format("%Y%m%d"))) && name.ends_with(".ckpt.json")
    }

    pub fn write(&self, checkpoint: &CheckpointFile) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self
            .root
            .join(Self::file_name(checkpoint.reference_date, checkpoint.sequence));
        let file = File::create(&path)
            .with_context(|| format!("failed to create checkpoint {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, checkpoint)
            .with_context(|| format!("failed to serialize checkpoint {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush checkpoint {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, path: &Path) -> Result<CheckpointFile> {
        let file = File::open(path)
            .with_context(|| format!("failed to open checkpoint {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to deserialize checkpoint {}", path.display()))
    }

    /// Checkpoint files for one reference date, in flush order.
    pub fn list(&self, date: NaiveDate) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read checkpoint directory {}", self.root.display())
                })
            }
        };
        for entry in entries {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| Self::belongs_to(date, name));
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Remove every checkpoint file for the reference date; used both to
    /// clear stale leftovers at run start and after successful packaging.
    pub fn purge(&self, date: NaiveDate) -> Result<usize> {
        let files = self.list(date)?;
        let removed = files.len();
        for path in files {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove checkpoint {}", path.display()))?;
        }
        Ok(removed)
    }
}

/// State machine over the merged stream's monotonically increasing event
/// time. Cuts a checkpoint whenever the time crosses a step boundary,
/// swapping the live registry and serializing the retired generation in
/// the background, with at most one serialization in flight.
pub struct CheckpointScheduler {
    store: CheckpointStore,
    reference_date: NaiveDate,
    step_ms: i64,
    window: DateTime<Utc>,
    sequence: u32,
    flushes: u32,
    inflight: Option<JoinHandle<Result<()>>>,
}

impl CheckpointScheduler {
    pub fn new(
        store: CheckpointStore,
        reference_date: NaiveDate,
        step: Duration,
        first_event: DateTime<Utc>,
    ) -> Self {
        let step_ms = step.num_milliseconds().max(1);
        Self {
            store,
            reference_date,
            step_ms,
            window: align(first_event, step_ms),
            sequence: 0,
            flushes: 0,
            inflight: None,
        }
    }

    /// Cut a checkpoint when `time` has crossed into a new window.
    /// Returns whether a flush happened. All buffered records predate the
    /// record that crossed the boundary, so flushing at the new boundary
    /// drains the retired generation completely.
    pub fn observe(&mut self, time: DateTime<Utc>, registry: &mut ProcessorRegistry) -> Result<bool> {
        let boundary = align(time, self.step_ms);
        if boundary <= self.window {
            return Ok(false);
        }
        self.wait_inflight()?;
        let fresh = registry.fresh();
        let mut retired = mem::replace(registry, fresh);
        let snapshots = retired.flush(boundary, false);
        self.spawn_serializer(snapshots, boundary, false)?;
        self.window = boundary;
        Ok(true)
    }

    /// Terminal flush: drain everything and block until it is durable.
    pub fn finish(
        &mut self,
        registry: &mut ProcessorRegistry,
        frontier: DateTime<Utc>,
    ) -> Result<()> {
        self.wait_inflight()?;
        let snapshots = registry.flush(frontier, true);
        self.spawn_serializer(snapshots, frontier, true)?;
        self.wait_inflight()
    }

    /// Number of checkpoint files written so far.
    #[must_use]
    pub fn flushes(&self) -> u32 {
        self.flushes
    }

    fn spawn_serializer(
        &mut self,
        snapshots: Vec<ProcessorSnapshot>,
        cutoff: DateTime<Utc>,
        is_final: bool,
    ) -> Result<()> {
        if snapshots.is_empty() {
            debug!(%cutoff, "nothing buffered; skipping checkpoint");
            return Ok(());
        }
        let checkpoint = CheckpointFile {
            reference_date: self.reference_date,
            sequence: self.sequence,
            cutoff,
            is_final,
            snapshots,
        };
        self.sequence += 1;
        self.flushes += 1;
        let store = self.store.clone();
        let handle = std::thread::Builder::new()
            .name("checkpoint-serializer".into())
            .spawn(move || {
                let path = store.write(&checkpoint)?;
                debug!(path = %path.display(), "checkpoint written");
                Ok(())
            })
            .context("failed to spawn checkpoint serializer")?;
        self.inflight = Some(handle);
        Ok(())
    }

    /// The binary gate: join the in-flight serialization, propagating its
    /// failure synchronously to the caller.
    fn wait_inflight(&mut self) -> Result<()> {
        match self.inflight.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("checkpoint serializer panicked"))?,
            None => Ok(()),
        }
    }
}

fn align(time: DateTime<Utc>, step_ms: i64) -> DateTime<Utc> {
    let ms = time.timestamp_millis();
    DateTime::from_timestamp_millis(ms - ms.rem_euclid(step_ms)).unwrap_or(time)
}
