//! Extracted rows, grouped for per-symbol access.
//!
//! Either held in memory (file mode, or a store run without a cache) or backed
//! by a cache artifact read one symbol at a time with predicate pushdown.
//! Symbols are always reported in first-encounter order.

use crate::error::PipelineError;
use barforge_core::data::{frame_to_bars, Deduplicator};
use barforge_core::domain::{RawBar, SymbolSeries};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fragments per symbol, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedBars {
    order: Vec<String>,
    fragments: HashMap<String, Vec<Vec<RawBar>>>,
}

impl GroupedBars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one fragment for `symbol`. Later fragments win on duplicate
    /// timestamps.
    pub fn push_fragment(&mut self, symbol: &str, bars: Vec<RawBar>) {
        match self.fragments.get_mut(symbol) {
            Some(existing) => existing.push(bars),
            None => {
                self.order.push(symbol.to_string());
                self.fragments.insert(symbol.to_string(), vec![bars]);
            }
        }
    }

    /// Group a flat row stream; each contiguous run of one symbol is a fragment.
    pub fn from_rows(bars: Vec<RawBar>) -> Self {
        let mut grouped = Self::new();
        let mut run: Vec<RawBar> = Vec::new();
        for bar in bars {
            if run.last().is_some_and(|last| last.symbol != bar.symbol) {
                let symbol = run[0].symbol.clone();
                grouped.push_fragment(&symbol, std::mem::take(&mut run));
            }
            run.push(bar);
        }
        if let Some(first) = run.first() {
            let symbol = first.symbol.clone();
            grouped.push_fragment(&symbol, run);
        }
        grouped
    }

    pub fn symbols(&self) -> &[String] {
        &self.order
    }

    pub fn row_count(&self) -> usize {
        self.fragments.values().flatten().map(Vec::len).sum()
    }
}

/// Source of per-symbol series for alignment.
#[derive(Debug, Clone)]
pub enum Dataset {
    InMemory(GroupedBars),
    Artifact(ArtifactDataset),
}

impl Dataset {
    pub fn symbols(&self) -> &[String] {
        match self {
            Dataset::InMemory(grouped) => grouped.symbols(),
            Dataset::Artifact(artifact) => &artifact.symbols,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            Dataset::InMemory(grouped) => grouped.row_count(),
            Dataset::Artifact(artifact) => artifact.rows,
        }
    }

    /// Deduplicated series for one symbol. Unknown symbols give an empty series.
    pub fn load(&self, symbol: &str) -> Result<SymbolSeries, PipelineError> {
        match self {
            Dataset::InMemory(grouped) => {
                let fragments = grouped.fragments.get(symbol).cloned().unwrap_or_default();
                Ok(Deduplicator::combine(symbol, fragments))
            }
            Dataset::Artifact(artifact) => artifact.load(symbol),
        }
    }

    /// Earliest and latest timestamps across all symbols.
    pub fn time_bounds(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, PipelineError> {
        match self {
            Dataset::InMemory(grouped) => {
                let mut bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
                for bar in grouped.fragments.values().flatten().flatten() {
                    bounds = Some(match bounds {
                        None => (bar.timestamp, bar.timestamp),
                        Some((lo, hi)) => (lo.min(bar.timestamp), hi.max(bar.timestamp)),
                    });
                }
                Ok(bounds)
            }
            Dataset::Artifact(artifact) => artifact.time_bounds(),
        }
    }
}

/// A cache artifact opened for per-symbol reads.
#[derive(Debug, Clone)]
pub struct ArtifactDataset {
    path: PathBuf,
    symbols: Vec<String>,
    rows: usize,
}

impl ArtifactDataset {
    /// Open an artifact, scanning only its symbol column.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let df = scan(path)?.select([col("symbol")]).collect()?;
        let column = df.column("symbol")?.str()?;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut symbols = Vec::new();
        for symbol in column.into_iter().flatten() {
            if seen.insert(symbol) {
                symbols.push(symbol.to_string());
            }
        }
        debug!(
            path = %path.display(),
            rows = df.height(),
            symbols = symbols.len(),
            "opened artifact"
        );
        Ok(Self {
            path: path.to_path_buf(),
            rows: df.height(),
            symbols,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self, symbol: &str) -> Result<SymbolSeries, PipelineError> {
        let df = scan(&self.path)?
            .filter(col("symbol").eq(lit(symbol)))
            .collect()?;
        let bars = frame_to_bars(&df)?;
        Ok(Deduplicator::combine(symbol, [bars]))
    }

    fn time_bounds(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, PipelineError> {
        let df = scan(&self.path)?
            .select([
                col("timestamp").cast(DataType::Int64).min().alias("lo"),
                col("timestamp").cast(DataType::Int64).max().alias("hi"),
            ])
            .collect()?;
        let lo = df.column("lo")?.i64()?.get(0);
        let hi = df.column("hi")?.i64()?.get(0);
        Ok(match (lo, hi) {
            (Some(lo), Some(hi)) => DateTime::from_timestamp_millis(lo)
                .zip(DateTime::from_timestamp_millis(hi)),
            _ => None,
        })
    }
}

fn scan(path: &Path) -> Result<LazyFrame, PipelineError> {
    Ok(LazyFrame::scan_parquet(path, ScanArgsParquet::default())?)
}
