//! Layered converter configuration: serde defaults, an optional TOML
//! file, and `TICKFORGE_`-prefixed environment variables.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use config::{Config, Environment, File};
use serde::Deserialize;

use tickforge_core::Resolution;

/// Instruments tracked when no allow-list is configured.
const DEFAULT_TICKERS: &[&str] = &["AAPL", "TWX", "NWSA", "FOXA", "AIG", "EGLE", "EGEC"];

/// Tunable pipeline knobs; everything here has a sensible default so a
/// bare run only needs the date and directories.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "PipelineSettings::default_resolution")]
    pub resolution: Resolution,
    #[serde(default = "PipelineSettings::default_flush_step_minutes")]
    pub flush_step_minutes: u32,
    #[serde(default = "PipelineSettings::default_tickers")]
    pub tickers: Vec<String>,
    #[serde(default = "PipelineSettings::default_decompressor")]
    pub decompressor: String,
    #[serde(default = "PipelineSettings::default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    #[serde(default = "PipelineSettings::default_extract_workers")]
    pub extract_workers: usize,
    #[serde(default = "PipelineSettings::default_package_workers")]
    pub package_workers: usize,
    #[serde(default)]
    pub keep_checkpoints: bool,
}

impl PipelineSettings {
    /// Load settings from an optional TOML file layered under environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        let config = builder
            .add_source(Environment::with_prefix("TICKFORGE"))
            .build()
            .context("failed to assemble configuration")?;
        config
            .try_deserialize()
            .context("failed to deserialize configuration")
    }

    fn default_resolution() -> Resolution {
        Resolution::Tick
    }

    fn default_flush_step_minutes() -> u32 {
        5
    }

    fn default_tickers() -> Vec<String> {
        DEFAULT_TICKERS.iter().map(ToString::to_string).collect()
    }

    fn default_decompressor() -> String {
        "7z".to_string()
    }

    fn default_extract_timeout_secs() -> u64 {
        180
    }

    fn default_extract_workers() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4)
    }

    fn default_package_workers() -> usize {
        4
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            resolution: Self::default_resolution(),
            flush_step_minutes: Self::default_flush_step_minutes(),
            tickers: Self::default_tickers(),
            decompressor: Self::default_decompressor(),
            extract_timeout_secs: Self::default_extract_timeout_secs(),
            extract_workers: Self::default_extract_workers(),
            package_workers: Self::default_package_workers(),
            keep_checkpoints: false,
        }
    }
}

/// Fully resolved configuration for one conversion run.
#[derive(Clone, Debug)]
pub struct ConverterConfig {
    /// The calendar day this run converts.
    pub reference_date: NaiveDate,
    /// Directory holding raw archives and/or extracted flat files.
    pub source_dir: PathBuf,
    /// Root under which output archives are published.
    pub destination_dir: PathBuf,
    /// Directory for intermediate checkpoint files.
    pub checkpoint_dir: PathBuf,
    pub settings: PipelineSettings,
}

impl ConverterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.settings.flush_step_minutes == 0 {
            bail!("flush_step_minutes must be at least 1");
        }
        if self.settings.tickers.is_empty() {
            bail!("the instrument allow-list is empty; nothing would be converted");
        }
        Ok(())
    }

    /// Checkpoint window width.
    #[must_use]
    pub fn flush_step(&self) -> Duration {
        Duration::minutes(i64::from(self.settings.flush_step_minutes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config_with(settings: PipelineSettings) -> ConverterConfig {
        ConverterConfig {
            reference_date: NaiveDate::from_ymd_opt(2015, 12, 24).unwrap(),
            source_dir: PathBuf::from("src"),
            destination_dir: PathBuf::from("dst"),
            checkpoint_dir: PathBuf::from("ckpt"),
            settings,
        }
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let settings = PipelineSettings::load(None).unwrap();
        assert_eq!(settings.flush_step_minutes, 5);
        assert_eq!(settings.resolution, Resolution::Tick);
        assert_eq!(settings.decompressor, "7z");
        assert!(settings.tickers.contains(&"AAPL".to_string()));
        assert!(!settings.keep_checkpoints);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tickforge.toml");
        fs::write(
            &path,
            "flush_step_minutes = 15\nresolution = \"minute\"\ntickers = [\"SPY\"]\n",
        )
        .unwrap();
        let settings = PipelineSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.flush_step_minutes, 15);
        assert_eq!(settings.resolution, Resolution::Minute);
        assert_eq!(settings.tickers, vec!["SPY".to_string()]);
        assert_eq!(settings.decompressor, "7z");
    }

    #[test]
    fn validation_rejects_degenerate_settings() {
        let mut settings = PipelineSettings::default();
        settings.flush_step_minutes = 0;
        assert!(config_with(settings).validate().is_err());

        let mut settings = PipelineSettings::default();
        settings.tickers.clear();
        assert!(config_with(settings).validate().is_err());

        assert!(config_with(PipelineSettings::default()).validate().is_ok());
    }
}
