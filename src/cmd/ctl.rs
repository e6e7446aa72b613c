use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::aggregator::FoldPolicy;
use crate::scheduler::{FailurePolicy, JobConfig};
use crate::sink::SinkFormat;
use crate::standalone::{self, InputFormat, Job};
use crate::Result;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job: transform every input record and write per-key lengths
    Run(RunArgs),
    /// Pack files into a Parquet input file, one record per file
    Pack {
        /// Glob spec for the files to pack
        #[arg(short, long)]
        input: String,

        /// Parquet file to write
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Glob spec for the input files
    #[arg(short, long)]
    pub input: String,

    /// How to read the input files
    #[arg(long, value_enum, default_value_t = InputFormat::Parquet)]
    pub input_format: InputFormat,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = SinkFormat::Parquet)]
    pub format: SinkFormat,

    /// JSON job file with worker, retry, timeout and policy settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Worker pool size [default: number of cores]
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Retries after the first failed attempt [default: 3]
    #[arg(short = 'r', long)]
    pub max_retries: Option<u32>,

    /// Per-attempt timeout in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,

    /// What to do after a permanent failure [default: continue]
    #[arg(short, long, value_enum)]
    pub policy: Option<FailurePolicy>,

    /// How results for one key are combined
    #[arg(long, value_enum, default_value_t = FoldPolicy::ExactlyOne)]
    pub fold: FoldPolicy,

    /// Name of the transform
    pub transform: String,

    /// Auxiliary arguments to pass to the transform.
    #[clap(value_parser, last = true)]
    pub args: Vec<String>,
}

impl RunArgs {
    /// Builds the [`Job`]. Flags override the config file, which overrides
    /// the defaults.
    pub fn into_job(self) -> Result<Job> {
        let mut config = match &self.config {
            Some(path) => standalone::load_config(path)?,
            None => JobConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if self.timeout_ms.is_some() {
            config.attempt_timeout_ms = self.timeout_ms;
        }
        if let Some(policy) = self.policy {
            config.failure_policy = policy;
        }
        config.validate()?;

        Ok(Job {
            input: self.input,
            input_format: self.input_format,
            output: self.output,
            output_format: self.format,
            transform: self.transform,
            args: self.args,
            fold: self.fold,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["mrp-ctl", "run"];
        full.extend_from_slice(argv);
        match Args::try_parse_from(full).unwrap().command {
            Commands::Run(run) => run,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn transform_args_follow_the_separator() {
        let run = run_args(&[
            "-i", "in/*.parquet", "-o", "out.parquet", "-r", "2", "--policy", "abort", "command",
            "--", "--suffix", ".gz", "gzip", "{}",
        ]);
        assert_eq!(run.max_retries, Some(2));
        assert_eq!(run.policy, Some(FailurePolicy::Abort));
        assert_eq!(run.fold, FoldPolicy::ExactlyOne);
        assert_eq!(run.transform, "command");
        assert_eq!(run.args, ["--suffix", ".gz", "gzip", "{}"]);
    }

    #[test]
    fn flags_override_defaults() {
        let job = run_args(&[
            "-i", "in", "--input-format", "files", "-o", "out.json", "-f", "json", "-w", "2",
            "-r", "0", "-t", "100", "--fold", "sum", "identity",
        ])
        .into_job()
        .unwrap();
        assert_eq!(job.input_format, InputFormat::Files);
        assert_eq!(job.output_format, SinkFormat::Json);
        assert_eq!(job.fold, FoldPolicy::Sum);
        assert_eq!(job.config.workers, 2);
        assert_eq!(job.config.max_retries, 0);
        assert_eq!(job.config.attempt_timeout_ms, Some(100));
        assert_eq!(job.config.failure_policy, FailurePolicy::Continue);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let run = run_args(&["-i", "in", "-o", "out", "-w", "0", "identity"]);
        assert!(run.into_job().is_err());
    }
}
