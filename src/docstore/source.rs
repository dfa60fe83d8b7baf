//! Record sources scanned by docstore builds.

use super::{Record, RecordIter};
use crate::fio::Streamable;
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::sync::Arc;

/// Produces the records of a collection in storage order. Each call starts
/// a fresh pass.
pub trait RecordSource<T: Record>: Send + Sync {
    fn records(&self) -> Result<RecordIter<T>>;
}

impl<T: Record + Clone> RecordSource<T> for Vec<T> {
    fn records(&self) -> Result<RecordIter<T>> {
        Ok(Box::new(self.clone().into_iter().map(Ok)))
    }
}

/// Newline-delimited JSON read from any stream handle. Blank lines are
/// skipped.
pub struct JsonLines<T> {
    handle: Arc<dyn Streamable>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonLines<T> {
    pub fn new(handle: Arc<dyn Streamable>) -> Self {
        Self {
            handle,
            _record: PhantomData,
        }
    }
}

impl<T: Record> RecordSource<T> for JsonLines<T> {
    fn records(&self) -> Result<RecordIter<T>> {
        let name = self.handle.to_string();
        let reader = BufReader::new(self.handle.open()?);
        let iter = reader
            .lines()
            .enumerate()
            .filter(|(_, line)| !matches!(line, Ok(text) if text.trim().is_empty()))
            .map(move |(i, line)| {
                let line = line.with_context(|| format!("Failed to read {}", name))?;
                serde_json::from_str(&line)
                    .with_context(|| format!("Malformed record on line {} of {}", i + 1, name))
            });
        Ok(Box::new(iter))
    }
}
