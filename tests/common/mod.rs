#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mrpipe::aggregator::{Aggregator, FoldPolicy};
use mrpipe::executor::TaskExecutor;
use mrpipe::scheduler::{JobConfig, JobResult, Scheduler};
use mrpipe::source::{RecordSource, VecSource};
use mrpipe::workload::{from_fn, Transform};
use mrpipe::{Error, WorkItem};
use tokio_util::sync::CancellationToken;

pub fn config(workers: usize, max_retries: u32) -> JobConfig {
    JobConfig {
        workers,
        max_retries,
        ..Default::default()
    }
}

pub fn item(key: &str, len: usize) -> WorkItem {
    WorkItem::new(key, vec![b'.'; len])
}

pub fn identity() -> Arc<dyn Transform> {
    from_fn("identity", |p: &[u8]| Ok(p.to_vec()))
}

/// Counts calls, then delegates.
pub fn counting(calls: Arc<AtomicU32>, inner: Arc<dyn Transform>) -> Arc<dyn Transform> {
    from_fn("counting", move |p: &[u8]| {
        calls.fetch_add(1, Ordering::SeqCst);
        inner.apply(&mrpipe::executor::AttemptContext::new(1, None), p)
    })
}

pub fn always_fails() -> Arc<dyn Transform> {
    from_fn("false", |_: &[u8]| Err(Error::transform("exit status 1")))
}

/// Fails the first `failures` calls for each distinct payload, then echoes it.
pub fn flaky(failures: u32) -> Arc<dyn Transform> {
    let seen: Mutex<HashMap<Vec<u8>, u32>> = Mutex::new(HashMap::new());
    from_fn("flaky", move |p: &[u8]| {
        let mut seen = seen.lock().unwrap();
        let calls = seen.entry(p.to_vec()).or_insert(0);
        *calls += 1;
        if *calls <= failures {
            Err(Error::transform(format!("flaky failure {calls}")))
        } else {
            Ok(p.to_vec())
        }
    })
}

/// Sleeps, tracking the highest number of concurrent calls.
pub fn sleepy(delay: Duration, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<dyn Transform> {
    from_fn("sleepy", move |p: &[u8]| {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(delay);
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(p.to_vec())
    })
}

pub async fn run(
    config: JobConfig,
    transform: Arc<dyn Transform>,
    source: &mut dyn RecordSource,
    policy: FoldPolicy,
) -> (mrpipe::Result<JobResult>, Aggregator) {
    let scheduler = Scheduler::new(config, TaskExecutor::new(transform));
    let mut aggregator = Aggregator::new(policy);
    let result = scheduler
        .submit(source, &mut aggregator, &CancellationToken::new())
        .await;
    (result, aggregator)
}

pub async fn run_items(
    config: JobConfig,
    transform: Arc<dyn Transform>,
    items: Vec<WorkItem>,
) -> (JobResult, Aggregator) {
    let mut source = VecSource::new(items);
    let (result, aggregator) = run(config, transform, &mut source, FoldPolicy::ExactlyOne).await;
    (result.unwrap(), aggregator)
}
