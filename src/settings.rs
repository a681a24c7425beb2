use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Process settings. Layered: built-in defaults, then an optional
/// `flats_ingest.toml` in the working directory, then `FLATS_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where intermediate `.jsonl` artifacts and temp feeds live.
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub sources_path: PathBuf,
    pub offer_batch_size: usize,
    pub extract_workers: usize,
    pub feed_workers: usize,
    pub load_batch_size: usize,
    pub load_workers: usize,
    /// Batches the writer task may have queued before loaders block.
    pub writer_queue: usize,
    pub accept_invalid_certs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data/base_flat"),
            db_path: PathBuf::from("data/flats.sqlite"),
            sources_path: PathBuf::from("sources.json"),
            offer_batch_size: 50,
            extract_workers: 3,
            feed_workers: 6,
            load_batch_size: 5000,
            load_workers: 6,
            writer_queue: 16,
            accept_invalid_certs: false,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name("flats_ingest").required(false))
            .add_source(Environment::with_prefix("FLATS"))
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")?;
        Ok(settings.sanitized())
    }

    /// Sizes and pool widths of zero would stall the pipeline; treat them as one.
    fn sanitized(mut self) -> Self {
        for v in [
            &mut self.offer_batch_size,
            &mut self.extract_workers,
            &mut self.feed_workers,
            &mut self.load_batch_size,
            &mut self.load_workers,
            &mut self.writer_queue,
        ] {
            *v = (*v).max(1);
        }
        self
    }
}
