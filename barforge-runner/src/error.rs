//! Error taxonomy for the ingestion run.
//!
//! Two tiers:
//! - `PipelineError` is fatal and aborts the run before anything is published.
//! - `ItemFailure` is recovered: one file or one symbol failed, was logged and
//!   skipped. Per-item results reduce into an `Outcome` (successes + failure log).

use crate::cache::CacheError;
use crate::config::ConfigError;
use barforge_core::data::DataError;
use polars::prelude::PolarsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fatal errors. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("no valid data: {0}")]
    NoValidData(String),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("data: {0}")]
    Data(#[from] DataError),

    #[error("polars: {0}")]
    Polars(#[from] PolarsError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("bundle writer: {0}")]
    Writer(String),
}

/// Errors raised by a single store query or file read.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("unreadable file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("bad timestamp '{value}'")]
    BadTimestamp { value: String },

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("polars: {0}")]
    Polars(#[from] PolarsError),

    #[error("duckdb: {0}")]
    DuckDb(#[from] duckdb::Error),
}

impl SourceError {
    /// Escalate to a fatal error (probe or whole-table failure).
    pub fn unavailable(self) -> PipelineError {
        PipelineError::SourceUnavailable(self.to_string())
    }

    /// Demote to a recovered per-item failure.
    pub fn for_item(self, kind: FailureKind, item: impl Into<String>) -> ItemFailure {
        ItemFailure {
            kind,
            item: item.into(),
            reason: self.to_string(),
        }
    }
}

/// Which unit of work failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    PerFileRead,
    PerSymbolExtraction,
}

/// A recovered, logged and skipped failure of one file or symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub item: String,
    pub reason: String,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FailureKind::PerFileRead => "file",
            FailureKind::PerSymbolExtraction => "symbol",
        };
        write!(f, "{kind} '{}': {}", self.item, self.reason)
    }
}

/// Successes plus the failure log, reduced from per-item results.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub successes: Vec<T>,
    pub failures: Vec<ItemFailure>,
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> Outcome<T> {
    pub fn push(&mut self, result: Result<T, ItemFailure>) {
        match result {
            Ok(value) => self.successes.push(value),
            Err(failure) => self.failures.push(failure),
        }
    }

    pub fn is_all_failed(&self) -> bool {
        self.successes.is_empty() && !self.failures.is_empty()
    }
}

impl<T> FromIterator<Result<T, ItemFailure>> for Outcome<T> {
    fn from_iter<I: IntoIterator<Item = Result<T, ItemFailure>>>(iter: I) -> Self {
        let mut outcome = Outcome::default();
        for result in iter {
            outcome.push(result);
        }
        outcome
    }
}
