//! A fault-tolerant, single-process MapReduce pipeline for binary blobs.
//!
//! Records are pulled from a [`source::RecordSource`], every payload is run
//! through a [`workload::Transform`] (an in-process codec or an external
//! command such as `gzip`) on a bounded worker pool, and the transformed
//! results are folded per key into one byte length by an
//! [`aggregator::Aggregator`] before a [`sink::Sink`] publishes them.
//! Failed attempts are retried up to a configured limit; failures that
//! survive every retry are reported in the [`scheduler::JobResult`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod aggregator;
pub mod cmd;
pub mod codec;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod standalone;
pub mod utils;
pub mod workload;

pub use error::{Error, ErrorKind, Result};

/////////////////////////////////////////////////////////////////////////////
// Work items
/////////////////////////////////////////////////////////////////////////////

/// One unit of input: a key and the blob to transform.
///
/// Keys are not unique; several items may share one, and their results
/// are folded together by the aggregator.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct WorkItem {
    /// The key.
    pub key: String,
    /// The payload handed to the transform.
    pub payload: Bytes,
    /// Position of the item in its source, assigned when it is pulled.
    pub seq: u64,
}

impl WorkItem {
    /// Construct a new work item. The sequence number is filled in by the
    /// scheduler when the item is pulled from its source.
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            seq: 0,
        }
    }

    /// Get the payload of this item.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Task results
/////////////////////////////////////////////////////////////////////////////

/// Why an attempt did not produce output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for TaskFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// The outcome of a single attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success(Bytes),
    Failure(TaskFailure),
}

/// The result of running one [`WorkItem`] through a transform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResult {
    pub key: String,
    pub seq: u64,
    /// 1-based attempt number that produced this result.
    pub attempt: u32,
    pub outcome: Outcome,
}

impl TaskResult {
    pub fn success(item: &WorkItem, attempt: u32, output: Bytes) -> Self {
        Self {
            key: item.key.clone(),
            seq: item.seq,
            attempt,
            outcome: Outcome::Success(output),
        }
    }

    pub fn failure(item: &WorkItem, attempt: u32, failure: TaskFailure) -> Self {
        Self {
            key: item.key.clone(),
            seq: item.seq,
            attempt,
            outcome: Outcome::Failure(failure),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }
}

/////////////////////////////////////////////////////////////////////////////
// Aggregated output
/////////////////////////////////////////////////////////////////////////////

/// One output row: a key and the folded byte length of its results.
///
/// `value` is `None` when at least one item for the key failed
/// permanently. Sinks write such keys with a length of `-1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub key: String,
    pub value: Option<u64>,
}

impl AggregatedRecord {
    pub fn new(key: impl Into<String>, value: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn failed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// The length as written by sinks, `-1` for failed keys.
    pub fn encoded_value(&self) -> i64 {
        self.value
            .map(|v| i64::try_from(v).unwrap_or(i64::MAX))
            .unwrap_or(-1)
    }
}
