use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::error;

use tickforge_core::Resolution;
use tickforge_data::{Converter, ConverterConfig, PackageSummary, PipelineSettings};

#[derive(Parser)]
#[command(author, version, about = "Tick export conversion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert one reference date of raw exports into output archives
    Convert {
        #[command(flatten)]
        common: CommonArgs,
        /// Stop after checkpointing; do not package archives
        #[arg(long)]
        no_package: bool,
    },
    /// Package previously written checkpoints into output archives
    Package {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Reference date to process (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,
    /// Directory of raw and/or extracted source files
    #[arg(long)]
    source: PathBuf,
    /// Output root for converted archives
    #[arg(long)]
    destination: PathBuf,
    /// Directory for intermediate checkpoint files
    /// (default: <destination>/checkpoints)
    #[arg(long)]
    checkpoints: Option<PathBuf>,
    /// Optional TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured bucket resolution
    #[arg(long)]
    resolution: Option<Resolution>,
    /// Override the checkpoint step in minutes
    #[arg(long)]
    flush_step: Option<u32>,
    /// Override the instrument allow-list (comma separated)
    #[arg(long, value_delimiter = ',')]
    tickers: Vec<String>,
    /// Keep checkpoint files after successful packaging
    #[arg(long)]
    keep_checkpoints: bool,
}

impl CommonArgs {
    fn build_config(&self) -> Result<ConverterConfig> {
        let mut settings = PipelineSettings::load(self.config.as_deref())?;
        if let Some(resolution) = self.resolution {
            settings.resolution = resolution;
        }
        if let Some(step) = self.flush_step {
            settings.flush_step_minutes = step;
        }
        if !self.tickers.is_empty() {
            settings.tickers = self.tickers.clone();
        }
        if self.keep_checkpoints {
            settings.keep_checkpoints = true;
        }
        let checkpoint_dir = self
            .checkpoints
            .clone()
            .unwrap_or_else(|| self.destination.join("checkpoints"));
        Ok(ConverterConfig {
            reference_date: self.date,
            source_dir: self.source.clone(),
            destination_dir: self.destination.clone(),
            checkpoint_dir,
            settings,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Convert { common, no_package } => {
            let converter = Converter::new(common.build_config()?)?;
            let summary = converter.run(!no_package).await?;
            println!(
                "Conversion complete for {}: records={}, malformed={}, flushes={}",
                common.date,
                summary.ingest.records,
                summary.ingest.malformed_lines,
                summary.ingest.flushes
            );
            if let Some(package) = &summary.package {
                report_packaging(package)?;
            }
        }
        Command::Package { common } => {
            let converter = Converter::new(common.build_config()?)?;
            let summary = converter.package().await?;
            report_packaging(&summary)?;
        }
    }
    Ok(())
}

fn report_packaging(summary: &PackageSummary) -> Result<()> {
    println!(
        "Packaged {} archive(s), {} entries",
        summary.archives_written, summary.entries_written
    );
    if summary.failures.is_empty() {
        return Ok(());
    }
    for failure in &summary.failures {
        error!(
            subject = %failure.subject,
            reason = %failure.reason,
            "packaging failure"
        );
    }
    bail!("{} archive(s) failed to package", summary.failures.len());
}
