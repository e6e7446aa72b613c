//! Error handling for the pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised anywhere in the pipeline.
///
/// `Transform`, `Io` and `Timeout` are produced by a single attempt and are
/// retried by the scheduler. Every other variant is fatal for the job.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read input record: {message}")]
    SourceRead {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("transform failed: {cause}")]
    Transform { cause: String },

    #[error("I/O operation failed: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("aggregator finalized before the job completed")]
    PrematureFinalize,

    #[error("failed to write output: {message}")]
    SinkWrite {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("key `{key}` received {count} results, expected exactly one")]
    DuplicateKey { key: String, count: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for pipeline operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification recorded with every failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceRead,
    Transform,
    Io,
    Timeout,
    /// The worker running the attempt panicked.
    Panicked,
    /// The item never finished because the job was aborted or cancelled.
    Cancelled,
    PrematureFinalize,
    SinkWrite,
    DuplicateKey,
    Config,
}

impl Error {
    pub fn source_read<S: Into<String>>(message: S) -> Self {
        Self::SourceRead {
            message: message.into(),
            source: None,
        }
    }

    pub fn source_read_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::SourceRead {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn transform<S: Into<String>>(cause: S) -> Self {
        Self::Transform {
            cause: cause.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn sink_write<S: Into<String>>(message: S) -> Self {
        Self::SinkWrite {
            message: message.into(),
            source: None,
        }
    }

    pub fn sink_write_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::SinkWrite {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SourceRead { .. } => ErrorKind::SourceRead,
            Error::Transform { .. } => ErrorKind::Transform,
            Error::Io { .. } => ErrorKind::Io,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::PrematureFinalize => ErrorKind::PrematureFinalize,
            Error::SinkWrite { .. } => ErrorKind::SinkWrite,
            Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a failed attempt with this error may be tried again.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transform | ErrorKind::Io | ErrorKind::Timeout | ErrorKind::Panicked
        )
    }
}
