//! Record sources: where work items come from.
//!
//! A source is lazy and finite. Once it returns `Ok(None)` it is exhausted;
//! re-reading needs a fresh instance.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
use tracing::debug;

use crate::{codec, Error, Result, WorkItem};

/// Produces [`WorkItem`]s one at a time.
pub trait RecordSource {
    /// Returns the next item, `Ok(None)` at end of stream.
    ///
    /// Malformed input is reported as [`Error::SourceRead`].
    fn next_item(&mut self) -> Result<Option<WorkItem>>;
}

/// An in-memory list of items.
#[derive(Debug, Default)]
pub struct VecSource {
    items: VecDeque<WorkItem>,
}

impl VecSource {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

impl RecordSource for VecSource {
    fn next_item(&mut self) -> Result<Option<WorkItem>> {
        Ok(self.items.pop_front())
    }
}

/// Reads items from one or more Parquet input files, batch by batch.
pub struct ParquetSource {
    files: VecDeque<PathBuf>,
    reader: Option<ParquetRecordBatchReader>,
    current: VecDeque<(String, Bytes)>,
}

impl ParquetSource {
    pub fn new(files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            files: files.into_iter().collect(),
            reader: None,
            current: VecDeque::new(),
        }
    }

    /// All files matching the glob `pattern`, in path order.
    pub fn from_glob(pattern: &str) -> Result<Self> {
        Ok(Self::new(expand_glob(pattern)?))
    }

    fn decode(batch: RecordBatch) -> Result<VecDeque<(String, Bytes)>> {
        codec::decode_items(&batch)
            .map(VecDeque::from)
            .map_err(|e| Error::source_read_with_source("malformed input batch", e))
    }
}

impl RecordSource for ParquetSource {
    fn next_item(&mut self) -> Result<Option<WorkItem>> {
        loop {
            if let Some((key, payload)) = self.current.pop_front() {
                return Ok(Some(WorkItem::new(key, payload)));
            }
            if let Some(reader) = self.reader.as_mut() {
                match reader.next() {
                    Some(Ok(batch)) => {
                        self.current = Self::decode(batch)?;
                        continue;
                    }
                    Some(Err(e)) => {
                        return Err(Error::source_read_with_source("failed to decode batch", e))
                    }
                    None => self.reader = None,
                }
            }
            let Some(path) = self.files.pop_front() else {
                return Ok(None);
            };
            debug!(path = %path.display(), "opening input file");
            let reader = codec::open_items(&path).map_err(|e| {
                Error::source_read_with_source(format!("cannot open {}", path.display()), e)
            })?;
            self.reader = Some(reader);
        }
    }
}

/// Every regular file matching a glob becomes one item, keyed by its path.
///
/// Files are read when their item is requested, not up front.
#[derive(Debug)]
pub struct FileSource {
    paths: VecDeque<PathBuf>,
}

impl FileSource {
    pub fn from_glob(pattern: &str) -> Result<Self> {
        Ok(Self {
            paths: expand_glob(pattern)?.into(),
        })
    }
}

impl RecordSource for FileSource {
    fn next_item(&mut self) -> Result<Option<WorkItem>> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let payload = fs::read(&path).map_err(|e| {
            Error::source_read_with_source(format!("cannot read {}", path.display()), e)
        })?;
        let key = path.to_string_lossy().into_owned();
        Ok(Some(WorkItem::new(key, payload)))
    }
}

fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob(pattern)
        .map_err(|e| Error::source_read_with_source(format!("bad glob `{pattern}`"), e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::source_read_with_source("unreadable path", e))?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
