//! Raw row sources.
//!
//! Two shapes of input:
//! - a queryable store (`BarStore`): DuckDB table or the in-memory store used
//!   by tests, probed for a row count and fetched page by page
//! - per-symbol flat files (`FileSource`): CSV or Parquet, one symbol per file
//!
//! Every source resolves timestamps to UTC before rows leave this module.

pub mod duckdb;
pub mod files;
pub mod memory;

pub use self::duckdb::DuckDbStore;
pub use files::{FileFragment, FileSource};
pub use memory::InMemoryStore;

use crate::config::{DateRange, PipelineConfig};
use crate::error::SourceError;
use barforge_core::domain::SourceRow;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Filter parameters shared by every store query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarQuery {
    pub range: DateRange,
    /// Allow-list of raw store symbols. `None` means all.
    pub symbols: Option<Vec<String>>,
}

impl BarQuery {
    pub fn new(range: DateRange, symbols: Option<Vec<String>>) -> Self {
        Self { range, symbols }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.date_range, config.symbol_filter.clone())
    }

    /// Same date window, restricted to `symbols`.
    pub fn for_symbols(&self, symbols: &[String]) -> Self {
        Self {
            range: self.range,
            symbols: Some(symbols.to_vec()),
        }
    }
}

/// One page of an ordered fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u64,
    pub offset: u64,
}

/// A queryable tabular store of minute rows.
///
/// `fetch` returns rows ordered by `(symbol, timestamp)` with ties broken by
/// the store's own insertion order, so every query and every page sees the
/// same total order. Rows without a timestamp sort last within their symbol.
///
/// Bad values inside a row never fail a fetch; they come back as `None` and
/// are rejected row by row during screening.
pub trait BarStore {
    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    /// Stable identity of the data behind the store, part of cache keys.
    fn identity(&self) -> String;

    /// Cheap row-count probe for the filtered query.
    fn estimate_rows(&self, query: &BarQuery) -> Result<u64, SourceError>;

    /// Distinct symbols matching the query, ascending.
    fn distinct_symbols(&self, query: &BarQuery) -> Result<Vec<String>, SourceError>;

    /// Rows matching the query, optionally one page of them.
    fn fetch(&self, query: &BarQuery, page: Option<Page>) -> Result<Vec<SourceRow>, SourceError>;
}

/// Parse a source timestamp.
///
/// Values with an explicit offset are honored as-is; naive values are wall
/// clock in `tz`. During a DST fold the earlier instant is taken.
pub fn parse_timestamp(value: &str, tz: Tz) -> Result<DateTime<Utc>, SourceError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, fmt) {
            return Ok(ts.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return localize(naive, tz).ok_or_else(|| SourceError::BadTimestamp {
                value: value.to_string(),
            });
        }
    }
    Err(SourceError::BadTimestamp {
        value: value.to_string(),
    })
}

/// Wall clock in `tz` to UTC. `None` only inside a DST gap.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}

/// True when `ts` falls inside `range`, judged by its local date in `tz`.
/// A row without a timestamp only passes an unbounded range, like a SQL
/// date predicate over NULL.
pub(crate) fn in_range(range: &DateRange, ts: Option<DateTime<Utc>>, tz: Tz) -> bool {
    match ts {
        Some(ts) => range.contains(ts.with_timezone(&tz).date_naive()),
        None => range.is_unbounded(),
    }
}
