//! Distributes work items over a fixed pool of workers.
//!
//! A single coordinating loop owns the attempt table. Workers run attempts
//! on tokio's blocking pool and report back over a channel, so every state
//! transition happens in one place and two workers finishing together can
//! never lose an update.
//!
//! Per attempt: `Pending -> Running -> {Succeeded | Failed}`. A failed
//! attempt goes back to `Pending` until `max_retries` retries are used up,
//! after which the failure is permanent and reported in the [`JobResult`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::executor::{AttemptContext, TaskExecutor};
use crate::source::RecordSource;
use crate::utils::default_workers;
use crate::{Error, ErrorKind, Outcome, Result, TaskFailure, TaskResult, WorkItem};

/////////////////////////////////////////////////////////////////////////////
// Configuration
/////////////////////////////////////////////////////////////////////////////

/// What to do once an item has failed permanently.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching, let in-flight attempts finish, report the job aborted.
    Abort,
    /// Keep going and report the failures at the end.
    #[default]
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// Number of attempts that may run at once.
    pub workers: usize,
    /// Retries after the first attempt; an item runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub attempt_timeout_ms: Option<u64>,
    pub failure_policy: FailurePolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: 3,
            attempt_timeout_ms: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl JobConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("worker pool size must be at least 1".into()));
        }
        if self.attempt_timeout_ms == Some(0) {
            return Err(Error::Config("attempt timeout must be positive".into()));
        }
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Job results
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every item succeeded.
    Succeeded,
    /// The job ran to the end but some items failed permanently.
    PartialFailure,
    /// Stopped after a permanent failure under [`FailurePolicy::Abort`].
    Aborted,
    Cancelled,
}

/// An item that will never succeed in this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub key: String,
    pub seq: u64,
    /// Attempts actually run; 0 if the item was cancelled before running.
    pub attempts: u32,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    /// Items pulled from the source.
    pub items: u64,
    /// Attempts dispatched, retries included.
    pub attempts: u64,
    pub succeeded: u64,
    pub failures: Vec<PermanentFailure>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/////////////////////////////////////////////////////////////////////////////
// Attempt table
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct TaskAttempt {
    item: WorkItem,
    /// Attempts started so far.
    attempt: u32,
    state: AttemptState,
}

/// Sent by a worker when its attempt ends.
#[derive(Debug)]
struct Completion {
    seq: u64,
    attempt: u32,
    outcome: Outcome,
}

/// Coordinator-owned state of one `submit` call.
#[derive(Default)]
struct JobState {
    table: HashMap<u64, TaskAttempt>,
    retries: VecDeque<u64>,
    next_seq: u64,
    exhausted: bool,
    halted: Option<JobStatus>,
    fatal: Option<Error>,
    in_flight: usize,
    attempts: u64,
    succeeded: u64,
    failures: Vec<PermanentFailure>,
}

impl JobState {
    fn stopping(&self) -> bool {
        self.halted.is_some() || self.fatal.is_some()
    }

    fn wants_dispatch(&self) -> bool {
        !self.stopping() && (!self.retries.is_empty() || !self.exhausted)
    }

    /// Picks the next attempt to run: queued retries first, then new items
    /// from the source. Marks it running.
    fn next_attempt<S: RecordSource + ?Sized>(&mut self, source: &mut S) -> Option<(WorkItem, u32)> {
        let seq = match self.retries.pop_front() {
            Some(seq) => seq,
            None => match source.next_item() {
                Ok(Some(mut item)) => {
                    item.seq = self.next_seq;
                    self.next_seq += 1;
                    let seq = item.seq;
                    self.table.insert(
                        seq,
                        TaskAttempt {
                            item,
                            attempt: 0,
                            state: AttemptState::Pending,
                        },
                    );
                    seq
                }
                Ok(None) => {
                    debug!(items = self.next_seq, "source exhausted");
                    self.exhausted = true;
                    return None;
                }
                Err(e) => {
                    error!(error = %e, "input is unreadable, aborting job");
                    self.fatal = Some(e);
                    return None;
                }
            },
        };
        let task = self.table.get_mut(&seq)?;
        task.attempt += 1;
        task.state = AttemptState::Running;
        self.in_flight += 1;
        self.attempts += 1;
        Some((task.item.clone(), task.attempt))
    }

    fn complete(&mut self, done: Completion, config: &JobConfig, aggregator: &mut Aggregator) {
        self.in_flight -= 1;
        let stopping = self.stopping();
        let Some(task) = self.table.get_mut(&done.seq) else {
            warn!(seq = done.seq, "completion for unknown attempt");
            return;
        };
        match done.outcome {
            Outcome::Success(output) => {
                task.state = AttemptState::Succeeded;
                debug!(key = %task.item.key, seq = done.seq, attempt = done.attempt, "attempt succeeded");
                if let Some(task) = self.table.remove(&done.seq) {
                    aggregator.accept(TaskResult::success(&task.item, done.attempt, output));
                    self.succeeded += 1;
                }
            }
            Outcome::Failure(failure) => {
                task.state = AttemptState::Failed;
                let retries_used = done.attempt.saturating_sub(1);
                if failure.kind.is_retryable()
                    && retries_used < config.max_retries
                    && !stopping
                {
                    warn!(
                        key = %task.item.key,
                        seq = done.seq,
                        attempt = done.attempt,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "attempt failed, retrying"
                    );
                    task.state = AttemptState::Pending;
                    self.retries.push_back(done.seq);
                    return;
                }
                if let Some(task) = self.table.remove(&done.seq) {
                    error!(
                        key = %task.item.key,
                        seq = done.seq,
                        attempts = done.attempt,
                        error = %failure.message,
                        "item failed permanently"
                    );
                    self.fail_permanently(task, failure, aggregator);
                }
                if config.failure_policy == FailurePolicy::Abort && !self.stopping() {
                    warn!("aborting job after permanent failure");
                    self.halted = Some(JobStatus::Aborted);
                }
            }
        }
    }

    fn fail_permanently(&mut self, task: TaskAttempt, failure: TaskFailure, aggregator: &mut Aggregator) {
        self.failures.push(PermanentFailure {
            key: task.item.key.clone(),
            seq: task.item.seq,
            attempts: task.attempt,
            kind: failure.kind,
            message: failure.message.clone(),
        });
        aggregator.accept(TaskResult::failure(&task.item, task.attempt, failure));
    }

    /// Turns everything still waiting in the table into cancelled failures
    /// and builds the job result.
    fn finish(mut self, aggregator: &mut Aggregator) -> Result<JobResult> {
        if let Some(err) = self.fatal.take() {
            return Err(err);
        }
        let mut leftover: Vec<u64> = self.table.keys().copied().collect();
        leftover.sort_unstable();
        for seq in leftover {
            if let Some(task) = self.table.remove(&seq) {
                debug!(key = %task.item.key, seq, state = ?task.state, "cancelling unfinished item");
                let failure = TaskFailure {
                    kind: ErrorKind::Cancelled,
                    message: "job stopped before the item finished".into(),
                };
                self.fail_permanently(task, failure, aggregator);
            }
        }
        aggregator.mark_complete();

        let status = match self.halted {
            Some(status) => status,
            None if self.failures.is_empty() => JobStatus::Succeeded,
            None => JobStatus::PartialFailure,
        };
        Ok(JobResult {
            status,
            items: self.next_seq,
            attempts: self.attempts,
            succeeded: self.succeeded,
            failures: self.failures,
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
// Scheduler
/////////////////////////////////////////////////////////////////////////////

pub struct Scheduler {
    config: JobConfig,
    executor: TaskExecutor,
}

impl Scheduler {
    pub fn new(config: JobConfig, executor: TaskExecutor) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Runs every item of `source` to a terminal outcome and feeds the
    /// results to `aggregator`.
    ///
    /// Returns `Err` only for fatal errors (unreadable input, invalid
    /// configuration); in-flight attempts are awaited first. Permanent
    /// per-item failures are part of the returned [`JobResult`]. Once
    /// `cancel` fires no new attempt is started.
    pub async fn submit<S: RecordSource + ?Sized>(
        &self,
        source: &mut S,
        aggregator: &mut Aggregator,
        cancel: &CancellationToken,
    ) -> Result<JobResult> {
        self.config.validate()?;
        info!(
            transform = self.executor.transform_name(),
            workers = self.config.workers,
            max_retries = self.config.max_retries,
            timeout_ms = ?self.config.attempt_timeout_ms,
            "starting job"
        );

        let pool = Arc::new(Semaphore::new(self.config.workers));
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(self.config.workers);
        let mut state = JobState::default();

        loop {
            let dispatch = state.wants_dispatch();
            if !dispatch && state.in_flight == 0 {
                break;
            }
            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !state.stopping() => {
                    warn!(in_flight = state.in_flight, "job cancelled, draining in-flight attempts");
                    state.halted = Some(JobStatus::Cancelled);
                }
                Some(done) = done_rx.recv(), if state.in_flight > 0 => {
                    state.complete(done, &self.config, aggregator);
                }
                permit = pool.clone().acquire_owned(), if dispatch => {
                    let Ok(permit) = permit else {
                        state.fatal = Some(Error::Config("worker pool closed".into()));
                        continue;
                    };
                    // An exhausted source or a read error hands the permit back.
                    let next = read_blocking(|| state.next_attempt(&mut *source));
                    if let Some((item, attempt)) = next {
                        self.dispatch(item, attempt, permit, done_tx.clone());
                    }
                }
                else => break,
            }
        }

        let result = state.finish(aggregator)?;
        info!(
            status = ?result.status,
            items = result.items,
            attempts = result.attempts,
            failed = result.failures.len(),
            "job finished"
        );
        Ok(result)
    }

    /// Starts one attempt. The permit is held by the blocking call itself,
    /// so a timed-out attempt keeps its worker slot until it really stops.
    fn dispatch(
        &self,
        item: WorkItem,
        attempt: u32,
        permit: OwnedSemaphorePermit,
        done: mpsc::Sender<Completion>,
    ) {
        let executor = self.executor.clone();
        let timeout = self.config.attempt_timeout();
        let seq = item.seq;
        debug!(key = %item.key, seq, attempt, "dispatching attempt");

        tokio::spawn(async move {
            let ctx = AttemptContext::new(attempt, timeout);
            let work = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                executor.execute(&ctx, &item).outcome
            });
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(joined) => joined_outcome(joined),
                    Err(_) => failure(&Error::Timeout(limit)),
                },
                None => joined_outcome(work.await),
            };
            if done.send(Completion { seq, attempt, outcome }).await.is_err() {
                debug!(seq, "coordinator gone, dropping completion");
            }
        });
    }
}

/// Runs a source read that may block on file I/O or decoding. On a
/// multi-thread runtime the worker thread's other tasks are handed off
/// first; `block_in_place` is not available on a current-thread runtime.
fn read_blocking<T>(read: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(read),
        _ => read(),
    }
}

fn failure(err: &Error) -> Outcome {
    Outcome::Failure(TaskFailure::from(err))
}

fn joined_outcome(joined: std::result::Result<Outcome, JoinError>) -> Outcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => Outcome::Failure(TaskFailure {
            kind: if e.is_panic() {
                ErrorKind::Panicked
            } else {
                ErrorKind::Cancelled
            },
            message: format!("worker stopped: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;
    use crate::workload::from_fn;
    use crate::AggregatedRecord;

    fn config(workers: usize, max_retries: u32) -> JobConfig {
        JobConfig {
            workers,
            max_retries,
            ..Default::default()
        }
    }

    #[test]
    fn zero_workers_is_invalid() {
        assert!(matches!(config(0, 1).validate(), Err(Error::Config(_))));
    }

    #[test]
    fn config_reads_partial_json() {
        let cfg: JobConfig =
            serde_json::from_str(r#"{"max_retries": 5, "failure_policy": "abort"}"#).unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.failure_policy, FailurePolicy::Abort);
        assert_eq!(cfg.workers, default_workers());
    }

    #[tokio::test]
    async fn panicking_transform_is_retried_then_fails() {
        let exec = TaskExecutor::new(from_fn("boom", |_: &[u8]| -> crate::Result<Vec<u8>> {
            panic!("transform blew up")
        }));
        let scheduler = Scheduler::new(config(1, 1), exec);
        let mut source = VecSource::new(vec![WorkItem::new("k", "x")]);
        let mut agg = Aggregator::default();
        let result = scheduler
            .submit(&mut source, &mut agg, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.failures[0].kind, ErrorKind::Panicked);
    }

    fn failed_attempt(seq: u64, attempt: u32) -> Completion {
        Completion {
            seq,
            attempt,
            outcome: failure(&Error::transform("exit status 1")),
        }
    }

    #[test]
    fn queued_retry_is_cancelled_when_the_job_aborts() {
        let cfg = JobConfig {
            failure_policy: FailurePolicy::Abort,
            ..config(2, 1)
        };
        let mut source = VecSource::new(vec![WorkItem::new("a", "a"), WorkItem::new("bad", "bad")]);
        let mut agg = Aggregator::default();
        let mut state = JobState::default();

        let (a, _) = state.next_attempt(&mut source).unwrap();
        let (bad, _) = state.next_attempt(&mut source).unwrap();

        // `bad` uses its one retry and is running again.
        state.complete(failed_attempt(bad.seq, 1), &cfg, &mut agg);
        assert_eq!(state.next_attempt(&mut source).unwrap().1, 2);

        // `a` fails with a retry left and waits for a free slot.
        state.complete(failed_attempt(a.seq, 1), &cfg, &mut agg);
        assert_eq!(state.retries, [a.seq]);

        state.complete(failed_attempt(bad.seq, 2), &cfg, &mut agg);
        assert_eq!(state.halted, Some(JobStatus::Aborted));
        assert!(!state.wants_dispatch());

        let result = state.finish(&mut agg).unwrap();
        assert_eq!(result.status, JobStatus::Aborted);
        assert_eq!(result.items, 2);
        assert_eq!(result.attempts, 3);
        let [first, second] = result.failures.as_slice() else {
            panic!("expected two failures, got {:?}", result.failures);
        };
        assert_eq!((first.key.as_str(), first.kind, first.attempts), ("bad", ErrorKind::Transform, 2));
        assert_eq!((second.key.as_str(), second.kind, second.attempts), ("a", ErrorKind::Cancelled, 1));
        assert_eq!(
            agg.finalize().unwrap(),
            vec![AggregatedRecord::failed("a"), AggregatedRecord::failed("bad")]
        );
    }

    #[tokio::test]
    async fn empty_source_succeeds_immediately() {
        let scheduler = Scheduler::new(
            config(2, 0),
            TaskExecutor::new(from_fn("id", |p: &[u8]| Ok(p.to_vec()))),
        );
        let mut agg = Aggregator::default();
        let result = scheduler
            .submit(&mut VecSource::default(), &mut agg, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.items, 0);
        assert!(agg.finalize().unwrap().is_empty());
    }
}
