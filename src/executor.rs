//! Runs one work item through the configured transform.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::workload::Transform;
use crate::{TaskFailure, TaskResult, WorkItem};

/// Identity and limits of a single attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Unique per attempt; scratch resources are named after it, never after
    /// the key, so retries and duplicate keys cannot collide.
    pub attempt_id: Uuid,
    /// 1-based.
    pub attempt: u32,
    /// The configured per-attempt limit.
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
}

impl AttemptContext {
    pub fn new(attempt: u32, timeout: Option<Duration>) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            attempt,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    transform: Arc<dyn Transform>,
}

impl TaskExecutor {
    pub fn new(transform: Arc<dyn Transform>) -> Self {
        Self { transform }
    }

    pub fn transform_name(&self) -> &str {
        self.transform.name()
    }

    /// Blocks until the transform finishes and returns its result. Errors
    /// are folded into a failed [`TaskResult`] rather than returned.
    pub fn execute(&self, ctx: &AttemptContext, item: &WorkItem) -> TaskResult {
        match self.transform.apply(ctx, &item.payload) {
            Ok(output) => {
                debug!(
                    key = %item.key,
                    seq = item.seq,
                    attempt = ctx.attempt,
                    input_len = item.payload.len(),
                    output_len = output.len(),
                    "transform finished"
                );
                TaskResult::success(item, ctx.attempt, Bytes::from(output))
            }
            Err(err) => TaskResult::failure(item, ctx.attempt, TaskFailure::from(&err)),
        }
    }
}
