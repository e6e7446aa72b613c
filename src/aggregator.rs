//! Folds task results into one record per key.
//!
//! Results may arrive in any order and results for one key need not be
//! contiguous. Every policy except [`FoldPolicy::LastAccepted`] produces the
//! same records for any arrival order of the same results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AggregatedRecord, Error, Outcome, Result, TaskResult};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum FoldPolicy {
    /// Exactly one result per key; more is an error at finalize.
    #[default]
    ExactlyOne,
    /// Keep the success that came first in the source.
    #[value(name = "first")]
    FirstInSource,
    /// Keep the success that came last in the source.
    #[value(name = "last")]
    LastInSource,
    /// Keep whichever success was accepted last. Depends on completion
    /// order, so it is not reproducible under concurrent execution.
    LastAccepted,
    /// Total length over all successes.
    Sum,
}

#[derive(Debug, Default)]
struct KeyState {
    results: usize,
    failed: bool,
    /// Source position and length of the retained success.
    kept: Option<(u64, u64)>,
    total: u64,
}

impl KeyState {
    fn fold(&mut self, policy: FoldPolicy, seq: u64, len: u64) {
        self.total += len;
        let replace = match (policy, self.kept) {
            (_, None) => true,
            (FoldPolicy::FirstInSource, Some((kept, _))) => seq < kept,
            (FoldPolicy::LastInSource, Some((kept, _))) => seq > kept,
            (FoldPolicy::ExactlyOne | FoldPolicy::LastAccepted, Some(_)) => true,
            (FoldPolicy::Sum, Some(_)) => false,
        };
        if replace {
            self.kept = Some((seq, len));
        }
    }

    fn value(&self, policy: FoldPolicy) -> Option<u64> {
        match policy {
            FoldPolicy::Sum => Some(self.total),
            _ => self.kept.map(|(_, len)| len),
        }
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    policy: FoldPolicy,
    groups: BTreeMap<String, KeyState>,
    complete: bool,
}

impl Aggregator {
    pub fn new(policy: FoldPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> FoldPolicy {
        self.policy
    }

    /// Takes one terminal result: a success, or a permanent failure.
    pub fn accept(&mut self, result: TaskResult) {
        if self.complete {
            warn!(key = %result.key, "result accepted after job completion");
        }
        let state = self.groups.entry(result.key).or_default();
        state.results += 1;
        match result.outcome {
            Outcome::Success(bytes) => state.fold(self.policy, result.seq, bytes.len() as u64),
            Outcome::Failure(_) => state.failed = true,
        }
    }

    /// Called by the scheduler once every item is terminal.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The folded records, sorted by key. Keys with a permanently failed
    /// item are marked failed.
    pub fn finalize(&self) -> Result<Vec<AggregatedRecord>> {
        if !self.complete {
            return Err(Error::PrematureFinalize);
        }
        if self.policy == FoldPolicy::ExactlyOne {
            if let Some((key, state)) = self.groups.iter().find(|(_, s)| s.results > 1) {
                return Err(Error::DuplicateKey {
                    key: key.clone(),
                    count: state.results,
                });
            }
        }
        Ok(self
            .groups
            .iter()
            .map(|(key, state)| match (state.failed, state.value(self.policy)) {
                (false, Some(value)) => AggregatedRecord::new(key.clone(), value),
                _ => AggregatedRecord::failed(key.clone()),
            })
            .collect())
    }
}
