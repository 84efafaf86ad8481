//! Conversion pipeline turning per-file historical tick exports into
//! compressed, time-partitioned archives: extract, merge, bucket,
//! checkpoint, package.
//!
//! The merge-and-bucket loop is single-threaded by design; ordering
//! correctness depends on one consumer driving the synchronizer. The
//! stages around it fan out: extraction and packaging over independent
//! files/archives, checkpoint serialization as a gated background task.

pub mod checkpoint;
pub mod config;
pub mod extract;
pub mod package;
pub mod processor;
pub mod reader;
pub mod sync;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use tickforge_core::{midnight, SymbolFilter};

use crate::checkpoint::{CheckpointScheduler, CheckpointStore};
pub use crate::config::{ConverterConfig, PipelineSettings};
pub use crate::package::{PackageFailure, PackageSummary};
use crate::processor::ProcessorRegistry;
use crate::reader::{ReaderStats, RecordReader};
use crate::sync::StreamSynchronizer;

const PROGRESS_EVERY: u64 = 1_000_000;
/// Cash session assumptions behind the advisory completion estimate.
const SESSION_CLOSE_HOUR: i64 = 16;
const SESSION_MINUTES: f64 = 390.0;

/// Tallies from the merge-and-bucket phase.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub source_files: usize,
    pub records: u64,
    pub malformed_lines: u64,
    pub filtered_lines: u64,
    pub render_skipped: u64,
    pub flushes: u32,
    pub elapsed_secs: f64,
}

/// Combined outcome of one conversion run.
#[derive(Debug)]
pub struct RunSummary {
    pub ingest: IngestSummary,
    pub package: Option<PackageSummary>,
}

/// One full conversion run for a reference date.
pub struct Converter {
    config: ConverterConfig,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Run the pipeline end to end: extract, ingest, and (optionally)
    /// package. Ingestion runs on the blocking pool; it is file- and
    /// CPU-bound and must not stall the async runtime.
    pub async fn run(&self, package: bool) -> Result<RunSummary> {
        let sources = extract::prepare_sources(&self.config).await?;
        let config = self.config.clone();
        let ingest = tokio::task::spawn_blocking(move || ingest(&config, sources))
            .await
            .context("ingestion task panicked")??;
        let package = if package {
            Some(package::package_all(&self.config).await?)
        } else {
            None
        };
        Ok(RunSummary { ingest, package })
    }

    /// Packaging alone, for re-running over an existing checkpoint set.
    pub async fn package(&self) -> Result<PackageSummary> {
        package::package_all(&self.config).await
    }
}

/// The merge-and-bucket main loop.
fn ingest(config: &ConverterConfig, sources: Vec<PathBuf>) -> Result<IngestSummary> {
    let started = Instant::now();
    let store = CheckpointStore::new(&config.checkpoint_dir);
    let stale = store.purge(config.reference_date)?;
    if stale > 0 {
        info!(removed = stale, "removed stale checkpoint files");
    }

    let filter = Arc::new(SymbolFilter::new(
        config.settings.tickers.iter().map(String::as_str),
    ));
    let stats = Arc::new(ReaderStats::default());
    let mut readers = Vec::with_capacity(sources.len());
    for path in &sources {
        readers.push(RecordReader::open(
            path.clone(),
            config.reference_date,
            filter.clone(),
            stats.clone(),
        )?);
    }
    info!(
        files = readers.len(),
        date = %config.reference_date,
        "synchronizing and processing ticks"
    );

    let mut summary = IngestSummary {
        source_files: sources.len(),
        ..IngestSummary::default()
    };
    let mut merged = StreamSynchronizer::new(readers);
    let Some(first) = merged.next() else {
        warn!("no records matched the configured instruments; nothing to convert");
        summary.malformed_lines = stats.malformed.load(Ordering::Relaxed);
        summary.filtered_lines = stats.filtered.load(Ordering::Relaxed);
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        return Ok(summary);
    };

    let mut scheduler = CheckpointScheduler::new(
        store,
        config.reference_date,
        config.flush_step(),
        first.time,
    );
    let mut registry = ProcessorRegistry::new(config.reference_date, config.settings.resolution);
    let mut frontier = first.time;
    let mut record = first;
    loop {
        // Flush decision first, so the record that crosses a boundary
        // lands in the fresh generation.
        scheduler.observe(record.time, &mut registry)?;
        frontier = record.time;
        if let Err(err) = registry.process(&record) {
            warn!(
                symbol = %record.instrument.symbol,
                error = %err,
                "dropping unrenderable record"
            );
            summary.render_skipped += 1;
        }
        summary.records += 1;
        if summary.records % PROGRESS_EVERY == 0 {
            log_progress(&summary, started, frontier, &registry, config);
        }
        match merged.next() {
            Some(next) => record = next,
            None => break,
        }
    }

    info!("performing final flush to disk");
    scheduler.finish(&mut registry, frontier)?;
    summary.flushes = scheduler.flushes();
    summary.malformed_lines = stats.malformed.load(Ordering::Relaxed);
    summary.filtered_lines = stats.filtered.load(Ordering::Relaxed);
    summary.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        records = summary.records,
        flushes = summary.flushes,
        malformed = summary.malformed_lines,
        filtered = summary.filtered_lines,
        elapsed_secs = format_args!("{:.1}", summary.elapsed_secs),
        "ingestion complete"
    );
    Ok(summary)
}

fn log_progress(
    summary: &IngestSummary,
    started: Instant,
    frontier: DateTime<Utc>,
    registry: &ProcessorRegistry,
    config: &ConverterConfig,
) {
    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let rate_k = summary.records as f64 / 1_000.0 / elapsed;
    let close = midnight(config.reference_date) + Duration::hours(SESSION_CLOSE_HOUR);
    let remaining_minutes = (close - frontier).num_minutes() as f64;
    let completed = (1.0 - remaining_minutes / SESSION_MINUTES).clamp(0.0, 1.0);
    info!(
        processed = summary.records,
        rate_k_per_sec = format_args!("{rate_k:.0}"),
        frontier = %frontier,
        symbols = registry.symbols(),
        buffered = registry.buffered(),
        completed = format_args!("{:.1}%", completed * 100.0),
        "processing ticks"
    );
}
