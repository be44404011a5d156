//! Extraction strategy selection and execution.
//!
//! The probed row count picks one of four strategies. All four deliver the
//! same rows in the same `(symbol, timestamp)` order to the sink; the choice
//! only trades query count against peak memory. A failing query never ends
//! the run on its own: every strategy falls back to one query per symbol and
//! records the symbols that still fail as item failures.
//!
//! | rows                         | strategy            |
//! |------------------------------|---------------------|
//! | `<= small`                   | Direct              |
//! | `<= large`                   | Chunked             |
//! | `<= ultra_large`             | PerSymbol           |
//! | `> ultra_large`              | PerSymbolBatched    |

use crate::config::{ChunkThresholds, PipelineConfig};
use crate::error::{FailureKind, ItemFailure, Outcome, PipelineError, SourceError};
use crate::scratch::ScratchWorkspace;
use crate::source::{BarQuery, BarStore, Page};
use barforge_core::data::{ValidityFilter, ValidityReport};
use barforge_core::domain::{RawBar, SourceRow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// The four extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    Direct,
    Chunked,
    PerSymbol,
    PerSymbolBatched,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Direct,
        Strategy::Chunked,
        Strategy::PerSymbol,
        Strategy::PerSymbolBatched,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Chunked => "chunked",
            Strategy::PerSymbol => "per_symbol",
            Strategy::PerSymbolBatched => "per_symbol_batched",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for extracted rows: an in-memory accumulator or a cache file.
pub trait RowSink {
    fn append(&mut self, bars: Vec<RawBar>) -> Result<(), PipelineError>;

    fn rows_written(&self) -> u64;
}

impl RowSink for Vec<RawBar> {
    fn append(&mut self, bars: Vec<RawBar>) -> Result<(), PipelineError> {
        self.extend(bars);
        Ok(())
    }

    fn rows_written(&self) -> u64 {
        self.len() as u64
    }
}

/// What one extraction did.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub strategy: Strategy,
    pub estimated_rows: u64,
    pub validity: ValidityReport,
    /// Symbols whose rows were fetched, whether or not any survived screening.
    pub symbols_extracted: usize,
    pub failures: Vec<ItemFailure>,
}

impl Extraction {
    fn new(strategy: Strategy, estimated_rows: u64) -> Self {
        Self {
            strategy,
            estimated_rows,
            validity: ValidityReport::default(),
            symbols_extracted: 0,
            failures: Vec::new(),
        }
    }
}

/// Chooses and runs an extraction strategy.
#[derive(Debug, Clone)]
pub struct ExtractionStrategist {
    thresholds: ChunkThresholds,
    scratch_parent: Option<PathBuf>,
}

impl ExtractionStrategist {
    pub fn new(thresholds: ChunkThresholds, scratch_parent: Option<PathBuf>) -> Self {
        Self {
            thresholds,
            scratch_parent,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.chunk_thresholds, config.scratch_dir.clone())
    }

    pub fn thresholds(&self) -> &ChunkThresholds {
        &self.thresholds
    }

    /// Strategy for a probed row count.
    pub fn select(&self, rows: u64) -> Strategy {
        let t = &self.thresholds;
        if rows <= t.small {
            Strategy::Direct
        } else if rows <= t.large {
            Strategy::Chunked
        } else if rows <= t.ultra_large {
            Strategy::PerSymbol
        } else {
            Strategy::PerSymbolBatched
        }
    }

    /// Probe, select by row count, and extract into `sink`.
    pub fn extract(
        &self,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
    ) -> Result<Extraction, PipelineError> {
        let estimated = store.estimate_rows(query).map_err(SourceError::unavailable)?;
        let strategy = self.select(estimated);
        info!(
            source = %store.describe(),
            rows = estimated,
            %strategy,
            "selected extraction strategy"
        );
        self.run(strategy, estimated, store, query, sink)
    }

    /// Extract with a fixed strategy regardless of row count.
    pub fn extract_with(
        &self,
        strategy: Strategy,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
    ) -> Result<Extraction, PipelineError> {
        let estimated = store.estimate_rows(query).map_err(SourceError::unavailable)?;
        info!(rows = estimated, %strategy, "forced extraction strategy");
        self.run(strategy, estimated, store, query, sink)
    }

    fn run(
        &self,
        strategy: Strategy,
        estimated: u64,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
    ) -> Result<Extraction, PipelineError> {
        let mut extraction = Extraction::new(strategy, estimated);
        match strategy {
            Strategy::Direct => self.direct(store, query, sink, &mut extraction)?,
            Strategy::Chunked => self.chunked(store, query, sink, &mut extraction)?,
            Strategy::PerSymbol => self.per_symbol(store, query, sink, &mut extraction, 1, None)?,
            Strategy::PerSymbolBatched => {
                let group = self.thresholds.symbol_group;
                self.per_symbol(store, query, sink, &mut extraction, group, None)?
            }
        }
        info!(
            %strategy,
            rows = sink.rows_written(),
            dropped = extraction.validity.dropped(),
            failures = extraction.failures.len(),
            "extraction finished"
        );
        Ok(extraction)
    }

    fn direct(
        &self,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
        extraction: &mut Extraction,
    ) -> Result<(), PipelineError> {
        let rows = match store.fetch(query, None) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "direct query failed, retrying per symbol");
                return self.per_symbol(store, query, sink, extraction, 1, None);
            }
        };
        let mut fragments = Vec::with_capacity(1);
        screen_into(rows, &mut fragments, extraction);
        compact(&mut fragments, sink)
    }

    /// Paged extraction. The trailing symbol of each page is held back until
    /// a later page shows the next symbol, so a failing page can resume per
    /// symbol right after the last symbol already delivered.
    fn chunked(
        &self,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
        extraction: &mut Extraction,
    ) -> Result<(), PipelineError> {
        let page_size = self.thresholds.page_size;
        let mut fragments: Vec<Vec<RawBar>> = Vec::with_capacity(self.thresholds.compact_every);
        let mut tail: Vec<SourceRow> = Vec::new();
        let mut delivered: Option<String> = None;
        let mut offset = 0u64;
        let mut pages = 0usize;

        loop {
            let page = Page {
                limit: page_size,
                offset,
            };
            let rows = match store.fetch(query, Some(page)) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(
                        offset,
                        after = delivered.as_deref().unwrap_or("-"),
                        error = %e,
                        "page query failed, retrying remaining symbols one by one"
                    );
                    compact(&mut fragments, sink)?;
                    return self.per_symbol(store, query, sink, extraction, 1, delivered.as_deref());
                }
            };
            let fetched = rows.len() as u64;
            tail.extend(rows);
            pages += 1;
            offset += fetched;
            debug!(page = pages, offset, "fetched page");

            if let Some(last) = tail.last().map(|r| r.symbol.clone()) {
                let split = tail.partition_point(|r| r.symbol < last);
                if split > 0 {
                    let held = tail.split_off(split);
                    let ready = std::mem::replace(&mut tail, held);
                    delivered = ready.last().map(|r| r.symbol.clone());
                    screen_into(ready, &mut fragments, extraction);
                }
            }

            if fragments.len() >= self.thresholds.compact_every {
                compact(&mut fragments, sink)?;
                reclaim_hint(&mut fragments, "chunked compaction");
            }
            if fetched < page_size {
                break;
            }
        }
        screen_into(tail, &mut fragments, extraction);
        compact(&mut fragments, sink)
    }

    /// Per-symbol extraction through a scratch workspace. `group` symbols are
    /// fetched per query; a failing group query is retried symbol by symbol.
    /// With `after`, only symbols sorting after it are extracted.
    fn per_symbol(
        &self,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
        extraction: &mut Extraction,
        group: usize,
        after: Option<&str>,
    ) -> Result<(), PipelineError> {
        let mut symbols = store
            .distinct_symbols(query)
            .map_err(SourceError::unavailable)?;
        if let Some(after) = after {
            symbols.retain(|s| s.as_str() > after);
        } else if symbols.is_empty() {
            return Err(PipelineError::NoValidData(
                "no symbols match the query".into(),
            ));
        }

        // Dropped on every exit path, taking the directory with it.
        let mut workspace = ScratchWorkspace::create(self.scratch_parent.as_deref())?;
        let mut pending: Vec<PathBuf> = Vec::new();
        let mut outcome: Outcome<String> = Outcome::default();

        for batch in symbols.chunks(group.max(1)) {
            let fetched = if batch.len() > 1 {
                match store.fetch(&query.for_symbols(batch), None) {
                    Ok(rows) => Some(rows),
                    Err(e) => {
                        warn!(
                            symbols = batch.len(),
                            error = %e,
                            "group query failed, retrying per symbol"
                        );
                        None
                    }
                }
            } else {
                None
            };

            match fetched {
                Some(rows) => {
                    let (bars, report) = ValidityFilter::apply(rows);
                    extraction.validity.merge(&report);
                    for run in bars.chunk_by(|a, b| a.symbol == b.symbol) {
                        pending.push(workspace.persist(&run[0].symbol, run)?);
                    }
                    outcome.successes.extend(batch.iter().cloned());
                }
                None => {
                    for symbol in batch {
                        match fetch_symbol(store, query, symbol) {
                            Ok(rows) => {
                                let (bars, report) = ValidityFilter::apply(rows);
                                extraction.validity.merge(&report);
                                if !bars.is_empty() {
                                    pending.push(workspace.persist(symbol, &bars)?);
                                }
                                outcome.push(Ok(symbol.clone()));
                            }
                            Err(failure) => outcome.push(Err(failure)),
                        }
                    }
                }
            }

            if pending.len() >= self.thresholds.combine_batch {
                sink.append(workspace.drain(&pending)?)?;
                pending.clear();
                debug!(written = sink.rows_written(), "combined scratch batch");
            }
            if group > 1 {
                reclaim_hint(&mut pending, "symbol group");
            }
        }
        if !pending.is_empty() {
            sink.append(workspace.drain(&pending)?)?;
        }

        extraction.symbols_extracted += outcome.successes.len();
        extraction.failures.extend(outcome.failures);
        if extraction.symbols_extracted == 0 {
            return Err(PipelineError::NoValidData(format!(
                "all {} symbol extractions failed",
                symbols.len()
            )));
        }
        debug!(
            files = workspace.files_written(),
            path = %workspace.path().display(),
            "releasing scratch workspace"
        );
        Ok(())
    }
}

/// Screen complete symbol runs and queue the survivors for the sink.
fn screen_into(
    rows: Vec<SourceRow>,
    fragments: &mut Vec<Vec<RawBar>>,
    extraction: &mut Extraction,
) {
    if rows.is_empty() {
        return;
    }
    extraction.symbols_extracted += rows.chunk_by(|a, b| a.symbol == b.symbol).count();
    let (bars, report) = ValidityFilter::apply(rows);
    extraction.validity.merge(&report);
    fragments.push(bars);
}

fn fetch_symbol(
    store: &dyn BarStore,
    query: &BarQuery,
    symbol: &str,
) -> Result<Vec<SourceRow>, ItemFailure> {
    store
        .fetch(&query.for_symbols(&[symbol.to_string()]), None)
        .map_err(|e| {
            warn!(%symbol, error = %e, "symbol extraction failed");
            e.for_item(FailureKind::PerSymbolExtraction, symbol)
        })
}

/// Concatenate buffered fragments into one and hand it to the sink.
fn compact(fragments: &mut Vec<Vec<RawBar>>, sink: &mut dyn RowSink) -> Result<(), PipelineError> {
    if fragments.is_empty() {
        return Ok(());
    }
    let total = fragments.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    for fragment in fragments.drain(..) {
        merged.extend(fragment);
    }
    sink.append(merged)
}

/// Release spare capacity held by an emptied buffer.
fn reclaim_hint<T>(buffer: &mut Vec<T>, stage: &str) {
    let before = buffer.capacity();
    buffer.shrink_to_fit();
    debug!(stage, released = before - buffer.capacity(), "reclaim hint");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn thresholds() -> ChunkThresholds {
        ChunkThresholds {
            small: 10,
            large: 100,
            ultra_large: 1000,
            page_size: 3,
            compact_every: 2,
            combine_batch: 2,
            symbol_group: 2,
            row_group_size: 4,
        }
    }

    fn row(symbol: &str, minute: i64, close: f64) -> SourceRow {
        SourceRow {
            symbol: symbol.into(),
            timestamp: Some(
                Utc.with_ymd_and_hms(2024, 1, 8, 3, 46, 0).unwrap() + Duration::minutes(minute),
            ),
            open: Some(close),
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            close: Some(close),
            volume: Some(10.0),
        }
    }

    fn store() -> InMemoryStore {
        let mut rows = Vec::new();
        for (i, symbol) in ["ACME", "BETA", "GAMMA", "DELTA", "OMEGA"].iter().enumerate() {
            for m in 0..4 {
                rows.push(row(symbol, m, 100.0 + i as f64));
            }
        }
        // Invalid row: low above high.
        let mut bad = row("BETA", 9, 50.0);
        bad.low = Some(60.0);
        rows.push(bad);
        InMemoryStore::new(rows)
    }

    #[test]
    fn selects_by_thresholds_inclusive() {
        let s = ExtractionStrategist::new(thresholds(), None);
        assert_eq!(s.select(0), Strategy::Direct);
        assert_eq!(s.select(10), Strategy::Direct);
        assert_eq!(s.select(11), Strategy::Chunked);
        assert_eq!(s.select(100), Strategy::Chunked);
        assert_eq!(s.select(101), Strategy::PerSymbol);
        assert_eq!(s.select(1000), Strategy::PerSymbol);
        assert_eq!(s.select(1001), Strategy::PerSymbolBatched);
    }

    #[test]
    fn extract_uses_probe() {
        let s = ExtractionStrategist::new(thresholds(), None);
        let mut sink = Vec::new();
        let extraction = s.extract(&store(), &BarQuery::default(), &mut sink).unwrap();
        assert_eq!(extraction.estimated_rows, 21);
        assert_eq!(extraction.strategy, Strategy::Chunked);
        assert_eq!(sink.len(), 20);
        assert_eq!(extraction.validity.dropped(), 1);
    }

    #[test]
    fn every_strategy_yields_identical_rows() {
        let s = ExtractionStrategist::new(thresholds(), None);
        let reference = {
            let mut sink = Vec::new();
            s.extract_with(Strategy::Direct, &store(), &BarQuery::default(), &mut sink)
                .unwrap();
            sink
        };
        for strategy in Strategy::ALL {
            let mut sink = Vec::new();
            s.extract_with(strategy, &store(), &BarQuery::default(), &mut sink)
                .unwrap();
            assert_eq!(sink, reference, "{strategy} diverged");
        }
    }

    #[test]
    fn failing_symbol_is_recovered_by_every_strategy() {
        let s = ExtractionStrategist::new(thresholds(), None);
        let store = store().with_failing_symbol("GAMMA");
        let mut reference: Option<Vec<RawBar>> = None;
        for strategy in Strategy::ALL {
            let mut sink = Vec::new();
            let extraction = s
                .extract_with(strategy, &store, &BarQuery::default(), &mut sink)
                .unwrap();
            assert_eq!(extraction.failures.len(), 1, "{strategy}");
            assert_eq!(extraction.failures[0].item, "GAMMA");
            assert_eq!(extraction.failures[0].kind, FailureKind::PerSymbolExtraction);
            assert_eq!(extraction.symbols_extracted, 4, "{strategy}");
            assert_eq!(extraction.validity.inverted_range, 1, "{strategy}");
            assert!(sink.iter().all(|b| b.symbol != "GAMMA"));
            assert_eq!(sink.len(), 16, "{strategy}");
            match &reference {
                Some(expected) => assert_eq!(&sink, expected, "{strategy} diverged"),
                None => reference = Some(sink),
            }
        }
    }

    #[test]
    fn chunked_resumes_after_last_delivered_symbol() {
        // Pages of 3: the fifth page is the first to reach GAMMA, after ACME
        // and BETA have been delivered and DELTA is held back.
        let s = ExtractionStrategist::new(thresholds(), None);
        let store = store().with_failing_symbol("GAMMA");
        let mut sink = Vec::new();
        s.extract_with(Strategy::Chunked, &store, &BarQuery::default(), &mut sink)
            .unwrap();

        let order: Vec<&str> = sink
            .chunk_by(|a, b| a.symbol == b.symbol)
            .map(|run| run[0].symbol.as_str())
            .collect();
        assert_eq!(order, vec!["ACME", "BETA", "DELTA", "OMEGA"]);
        assert_eq!(sink.iter().filter(|b| b.symbol == "DELTA").count(), 4);
    }

    #[test]
    fn unstamped_rows_are_screened_out_by_every_strategy() {
        let s = ExtractionStrategist::new(thresholds(), None);
        let mut rows: Vec<SourceRow> = (0..5).map(|m| row("ACME", m, 10.0)).collect();
        rows[2].timestamp = None;
        rows.push(row("ZED", 0, 20.0));
        let store = InMemoryStore::new(rows);

        for strategy in Strategy::ALL {
            let mut sink = Vec::new();
            let extraction = s
                .extract_with(strategy, &store, &BarQuery::default(), &mut sink)
                .unwrap();
            assert_eq!(extraction.validity.bad_timestamp, 1, "{strategy}");
            assert!(extraction.failures.is_empty(), "{strategy}");
            assert_eq!(sink.len(), 5, "{strategy}");
        }
    }

    #[test]
    fn all_symbols_failing_is_fatal() {
        let s = ExtractionStrategist::new(thresholds(), None);
        let store = InMemoryStore::new(vec![row("ACME", 0, 1.0)]).with_failing_symbol("ACME");
        for strategy in Strategy::ALL {
            let mut sink = Vec::new();
            let err = s
                .extract_with(strategy, &store, &BarQuery::default(), &mut sink)
                .unwrap_err();
            assert!(matches!(err, PipelineError::NoValidData(_)), "{strategy}");
        }
    }

    #[test]
    fn scratch_is_removed_after_success_and_failure() {
        let parent = tempfile::tempdir().unwrap();
        let s = ExtractionStrategist::new(thresholds(), Some(parent.path().to_path_buf()));

        let mut sink = Vec::new();
        s.extract_with(Strategy::PerSymbol, &store(), &BarQuery::default(), &mut sink)
            .unwrap();
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);

        let failing = InMemoryStore::new(vec![row("ACME", 0, 1.0)]).with_failing_symbol("ACME");
        let _ = s.extract_with(Strategy::PerSymbol, &failing, &BarQuery::default(), &mut sink);
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn chunked_handles_exact_page_multiple() {
        let rows: Vec<SourceRow> = (0..6).map(|m| row("ACME", m, 10.0)).collect();
        let s = ExtractionStrategist::new(thresholds(), None);
        let mut sink = Vec::new();
        let store = InMemoryStore::new(rows);
        s.extract_with(Strategy::Chunked, &store, &BarQuery::default(), &mut sink)
            .unwrap();
        assert_eq!(sink.len(), 6);
    }
}
