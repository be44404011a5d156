//! In-memory `BarStore`, used by tests and benchmarks.

use super::{in_range, BarQuery, BarStore, Page};
use crate::error::SourceError;
use barforge_core::domain::SourceRow;
use chrono_tz::Tz;
use std::collections::BTreeSet;

/// Rows held in a vector, queried like a table.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    rows: Vec<SourceRow>,
    tz: Tz,
    failing: BTreeSet<String>,
}

impl InMemoryStore {
    /// Rows are kept in insertion order; ties on `(symbol, timestamp)` fetch
    /// in that order. Date filters use UTC dates unless a timezone is set.
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self {
            rows,
            tz: chrono_tz::UTC,
            failing: BTreeSet::new(),
        }
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    /// Any fetch that would return a row of `symbol` fails, as if that
    /// symbol's rows could not be decoded.
    pub fn with_failing_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.failing.insert(symbol.into());
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn matching(&self, query: &BarQuery) -> Vec<&SourceRow> {
        let mut rows: Vec<&SourceRow> = self
            .rows
            .iter()
            .filter(|r| in_range(&query.range, r.timestamp, self.tz))
            .filter(|r| {
                query
                    .symbols
                    .as_ref()
                    .map_or(true, |allow| allow.iter().any(|s| s == &r.symbol))
            })
            .collect();
        // Stable sort: insertion order breaks ties, missing timestamps go last.
        rows.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.timestamp.is_none().cmp(&b.timestamp.is_none()))
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });
        rows
    }
}

impl BarStore for InMemoryStore {
    fn describe(&self) -> String {
        format!("in-memory store ({} rows)", self.rows.len())
    }

    fn estimate_rows(&self, query: &BarQuery) -> Result<u64, SourceError> {
        Ok(self.matching(query).len() as u64)
    }

    fn distinct_symbols(&self, query: &BarQuery) -> Result<Vec<String>, SourceError> {
        let symbols: BTreeSet<&str> = self
            .matching(query)
            .into_iter()
            .map(|r| r.symbol.as_str())
            .collect();
        Ok(symbols.into_iter().map(String::from).collect())
    }

    fn identity(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.tz.name().as_bytes());
        for row in &self.rows {
            let millis = row.timestamp.map_or(i64::MIN, |ts| ts.timestamp_millis());
            hasher.update(row.symbol.as_bytes());
            hasher.update(&millis.to_le_bytes());
            for value in [row.open, row.high, row.low, row.close, row.volume] {
                hasher.update(&value.unwrap_or(f64::NAN).to_le_bytes());
            }
        }
        format!("memory:{}", hasher.finalize().to_hex())
    }

    fn fetch(&self, query: &BarQuery, page: Option<Page>) -> Result<Vec<SourceRow>, SourceError> {
        let rows = self.matching(query).into_iter();
        let rows: Vec<SourceRow> = match page {
            Some(p) => rows
                .skip(p.offset as usize)
                .take(p.limit as usize)
                .cloned()
                .collect(),
            None => rows.cloned().collect(),
        };
        if let Some(bad) = rows.iter().find(|r| self.failing.contains(&r.symbol)) {
            return Err(SourceError::Query(format!("injected failure for {}", bad.symbol)));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DateRange;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn row(symbol: &str, minute: u32, close: f64) -> SourceRow {
        SourceRow {
            symbol: symbol.into(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 1, 8, 3, 46 + minute, 0).unwrap()),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            volume: Some(1.0),
        }
    }

    fn store() -> InMemoryStore {
        InMemoryStore::new(vec![
            row("ZED", 0, 1.0),
            row("ACME", 1, 2.0),
            row("ACME", 0, 3.0),
            row("ACME", 0, 4.0),
        ])
    }

    #[test]
    fn fetch_orders_by_symbol_then_time_keeping_ties_stable() {
        let rows = store().fetch(&BarQuery::default(), None).unwrap();
        let closes: Vec<f64> = rows.iter().filter_map(|r| r.close).collect();
        assert_eq!(closes, vec![3.0, 4.0, 2.0, 1.0]);
    }

    #[test]
    fn pages_partition_the_ordered_rows() {
        let s = store();
        let q = BarQuery::default();
        let first = s.fetch(&q, Some(Page { limit: 3, offset: 0 })).unwrap();
        let second = s.fetch(&q, Some(Page { limit: 3, offset: 3 })).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].symbol, "ZED");
    }

    #[test]
    fn filters_by_symbols_and_dates() {
        let s = store();
        let q = BarQuery::new(DateRange::default(), Some(vec!["ZED".into()]));
        assert_eq!(s.estimate_rows(&q).unwrap(), 1);

        let later = NaiveDate::from_ymd_opt(2024, 1, 9);
        let q = BarQuery::new(DateRange::new(later, None), None);
        assert_eq!(s.estimate_rows(&q).unwrap(), 0);
        assert!(s.distinct_symbols(&q).unwrap().is_empty());
    }

    #[test]
    fn distinct_symbols_are_sorted() {
        let symbols = store().distinct_symbols(&BarQuery::default()).unwrap();
        assert_eq!(symbols, vec!["ACME".to_string(), "ZED".to_string()]);
    }

    #[test]
    fn injected_failure_hits_queries_returning_the_symbol() {
        let s = store().with_failing_symbol("ZED");
        let q = BarQuery::default();
        assert!(s.fetch(&q.for_symbols(&["ZED".into()]), None).is_err());
        assert!(s.fetch(&q.for_symbols(&["ACME".into()]), None).is_ok());
        assert!(s.fetch(&q, None).is_err());
        // The first page holds only ACME rows.
        assert!(s.fetch(&q, Some(Page { limit: 3, offset: 0 })).is_ok());
        assert!(s.fetch(&q, Some(Page { limit: 3, offset: 3 })).is_err());
    }

    #[test]
    fn unstamped_rows_sort_last_within_their_symbol() {
        let mut unstamped = row("ACME", 0, 9.0);
        unstamped.timestamp = None;
        let s = InMemoryStore::new(vec![unstamped, row("ACME", 1, 2.0), row("ZED", 0, 1.0)]);

        let rows = s.fetch(&BarQuery::default(), None).unwrap();
        let closes: Vec<f64> = rows.iter().filter_map(|r| r.close).collect();
        assert_eq!(closes, vec![2.0, 9.0, 1.0]);

        let later = NaiveDate::from_ymd_opt(2024, 1, 8);
        let bounded = BarQuery::new(DateRange::new(later, None), None);
        assert_eq!(s.estimate_rows(&bounded).unwrap(), 2);
    }

    #[test]
    fn identity_follows_content() {
        assert_eq!(store().identity(), store().identity());
        let other = InMemoryStore::new(vec![row("ZED", 0, 1.5)]);
        assert_ne!(store().identity(), other.identity());
        assert_ne!(
            store().identity(),
            store().with_timezone(chrono_tz::Asia::Kolkata).identity()
        );
    }
}
