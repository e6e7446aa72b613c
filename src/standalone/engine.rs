use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::executor::TaskExecutor;
use crate::scheduler::{JobResult, JobStatus, Scheduler};
use crate::sink::{self, publish_atomically};
use crate::source::{FileSource, ParquetSource, RecordSource};
use crate::standalone::{InputFormat, Job};
use crate::workload::{self, Transform};
use crate::{codec, AggregatedRecord, Error, Result, WorkItem};

/// What a finished job produced.
#[derive(Debug)]
pub struct JobOutput {
    pub result: JobResult,
    /// Records handed to the sink; empty when the job was aborted or
    /// cancelled, in which case nothing is written.
    pub records: Vec<AggregatedRecord>,
}

pub fn open_source(job: &Job) -> Result<Box<dyn RecordSource>> {
    Ok(match job.input_format {
        InputFormat::Parquet => Box::new(ParquetSource::from_glob(&job.input)?),
        InputFormat::Files => Box::new(FileSource::from_glob(&job.input)?),
    })
}

/// Runs `job` end to end with the transform named in the job.
pub async fn run_job(job: &Job, cancel: &CancellationToken) -> Result<JobOutput> {
    let transform = workload::named(&job.transform, &job.args)
        .map_err(|e| Error::Config(format!("transform `{}`: {e:#}", job.transform)))?;
    run_job_with(job, transform, cancel).await
}

/// Runs `job` with an explicit transform; `job.transform` is ignored.
///
/// Source -> scheduler -> aggregator -> sink. Output is published when
/// every item reached a terminal state on its own (full success or partial
/// failure); an aborted or cancelled job writes nothing.
pub async fn run_job_with(
    job: &Job,
    transform: Arc<dyn Transform>,
    cancel: &CancellationToken,
) -> Result<JobOutput> {
    job.config.validate()?;
    let mut source = open_source(job)?;
    let scheduler = Scheduler::new(job.config.clone(), TaskExecutor::new(transform));
    let mut aggregator = Aggregator::new(job.fold);

    let result = scheduler
        .submit(source.as_mut(), &mut aggregator, cancel)
        .await?;

    if matches!(result.status, JobStatus::Aborted | JobStatus::Cancelled) {
        warn!(status = ?result.status, "job stopped early, no output written");
        return Ok(JobOutput {
            result,
            records: Vec::new(),
        });
    }

    let records = aggregator.finalize()?;
    sink::open(job.output_format, &job.output).write(&records)?;
    Ok(JobOutput { result, records })
}

/// Packs every file matching `pattern` into one Parquet input file at
/// `output`, keyed by path. Returns the number of packed files.
///
/// All payloads are held in memory until the file is written.
pub fn pack_inputs(pattern: &str, output: &Path) -> Result<usize> {
    let mut source = FileSource::from_glob(pattern)?;
    let mut items: Vec<WorkItem> = Vec::new();
    while let Some(item) = source.next_item()? {
        items.push(item);
    }
    publish_atomically(output, |file| codec::write_items(file, &items))?;
    info!(files = items.len(), path = %output.display(), "packed input");
    Ok(items.len())
}
