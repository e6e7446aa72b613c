//! Durable, atomic output.
//!
//! Every sink writes through [`publish_atomically`]: the data goes to a
//! temporary file in the destination directory, is synced, and is then
//! renamed over the destination. Readers see either the old file or the
//! complete new one, never a partial write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{codec, AggregatedRecord, Error, Result};

pub trait Sink {
    /// Persists `records`. Durable once this returns `Ok`.
    fn write(&mut self, records: &[AggregatedRecord]) -> Result<()>;
}

/// Runs `write` against a temporary file next to `dest` and publishes the
/// file at `dest` only if it succeeds.
pub fn publish_atomically<F>(dest: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> anyhow::Result<()>,
{
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| {
        Error::sink_write_with_source(format!("creating {}", dir.display()), e)
    })?;

    // Removed on drop unless persisted.
    let mut tmp = tempfile::Builder::new()
        .prefix(".mrp-")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| Error::sink_write_with_source("creating temporary file", e))?;

    write(tmp.as_file_mut())
        .map_err(|e| Error::sink_write_with_source(format!("writing {}", dest.display()), e))?;
    tmp.as_file_mut()
        .flush()
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::sink_write_with_source("syncing temporary file", e))?;
    tmp.persist(dest).map_err(|e| {
        Error::sink_write_with_source(format!("publishing {}", dest.display()), e.error)
    })?;
    sync_dir(&dir)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| Error::sink_write_with_source(format!("syncing {}", dir.display()), e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SinkFormat {
    #[default]
    Parquet,
    Json,
}

/// Snappy-compressed Parquet with `id` / `val` columns.
#[derive(Debug, Clone)]
pub struct ParquetSink {
    path: PathBuf,
}

impl ParquetSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for ParquetSink {
    fn write(&mut self, records: &[AggregatedRecord]) -> Result<()> {
        publish_atomically(&self.path, |file| codec::write_records(file, records))?;
        info!(path = %self.path.display(), records = records.len(), "output published");
        Ok(())
    }
}

/// A pretty-printed JSON array of records.
#[derive(Debug, Clone)]
pub struct JsonSink {
    path: PathBuf,
}

impl JsonSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sink for JsonSink {
    fn write(&mut self, records: &[AggregatedRecord]) -> Result<()> {
        publish_atomically(&self.path, |file| {
            serde_json::to_writer_pretty(&mut *file, records)?;
            writeln!(file)?;
            Ok(())
        })?;
        info!(path = %self.path.display(), records = records.len(), "output published");
        Ok(())
    }
}

pub fn open(format: SinkFormat, path: impl Into<PathBuf>) -> Box<dyn Sink> {
    match format {
        SinkFormat::Parquet => Box::new(ParquetSink::new(path)),
        SinkFormat::Json => Box::new(JsonSink::new(path)),
    }
}
