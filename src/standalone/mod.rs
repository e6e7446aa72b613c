//! A job description and the in-process engine that runs it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::aggregator::FoldPolicy;
use crate::scheduler::JobConfig;
use crate::sink::SinkFormat;
use crate::{Error, Result};

pub mod engine;

/// How the input location is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// Parquet files with `id` / `val` columns.
    #[default]
    Parquet,
    /// Every matching file is one item, keyed by its path.
    Files,
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Glob spec for the input files
    pub input: String,
    pub input_format: InputFormat,
    pub output: PathBuf,
    pub output_format: SinkFormat,
    /// Name of the transform, see [`crate::workload::named`]
    pub transform: String,
    /// Auxiliary arguments for the transform.
    pub args: Vec<String>,
    pub fold: FoldPolicy,
    pub config: JobConfig,
}

/// Loads a [`JobConfig`] from a JSON file. Missing fields take their
/// defaults.
pub fn load_config(path: &Path) -> Result<JobConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let config: JobConfig = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
