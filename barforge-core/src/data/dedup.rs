//! Per-symbol fragment merge with last-write-wins.
//!
//! Fragments arrive in processing order (file order, page order). After a
//! stable sort by timestamp, the last record seen for each timestamp wins, so
//! later fragments act as corrections to earlier ones.

use crate::domain::{RawBar, SymbolSeries};

/// Combines fragments of one normalized symbol into a `SymbolSeries`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator;

impl Deduplicator {
    /// Concatenate, sort by timestamp, keep the last bar per timestamp.
    ///
    /// Every bar is relabeled with `symbol`, since fragments may carry the
    /// raw, pre-normalization name.
    pub fn combine<I>(symbol: &str, fragments: I) -> SymbolSeries
    where
        I: IntoIterator<Item = Vec<RawBar>>,
    {
        let mut bars: Vec<RawBar> = fragments.into_iter().flatten().collect();
        // Stable: equal timestamps keep their arrival order.
        bars.sort_by_key(|b| b.timestamp);

        let mut out: Vec<RawBar> = Vec::with_capacity(bars.len());
        for mut bar in bars {
            bar.symbol.clear();
            bar.symbol.push_str(symbol);
            match out.last_mut() {
                Some(prev) if prev.timestamp == bar.timestamp => *prev = bar,
                _ => out.push(bar),
            }
        }
        out.shrink_to_fit();

        SymbolSeries::from_sorted_unique(symbol.to_string(), out)
    }

    /// Re-run the combiner over an existing series. A no-op on valid input.
    pub fn recombine(series: SymbolSeries) -> SymbolSeries {
        let symbol = series.symbol().to_string();
        Self::combine(&symbol, [series.into_bars()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 46, 0).unwrap()
            + chrono::Duration::minutes(minute as i64)
    }

    fn bar(symbol: &str, minute: u32, price: f64) -> RawBar {
        RawBar {
            symbol: symbol.into(),
            timestamp: at(minute),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 100,
        }
    }

    #[test]
    fn later_fragment_wins_on_same_timestamp() {
        let first = vec![bar("ACME", 0, 100.0)];
        let second = vec![bar("ACME", 0, 101.0)];

        let series = Deduplicator::combine("ACME", [first, second]);

        assert_eq!(series.len(), 1);
        assert_eq!(series.bars()[0].close, 101.0);
    }

    #[test]
    fn output_is_sorted_and_unique() {
        let a = vec![bar("ACME", 3, 1.0), bar("ACME", 1, 1.0)];
        let b = vec![bar("ACME", 2, 2.0), bar("ACME", 1, 2.0)];

        let series = Deduplicator::combine("ACME", [a, b]);
        let minutes: Vec<_> = series.bars().iter().map(|b| b.timestamp).collect();

        assert_eq!(minutes, vec![at(1), at(2), at(3)]);
        assert_eq!(series.bars()[0].close, 2.0);
    }

    #[test]
    fn relabels_raw_symbol_names() {
        let series = Deduplicator::combine("ACME", [vec![bar("acme-eq", 0, 5.0)]]);
        assert_eq!(series.bars()[0].symbol, "ACME");
        assert_eq!(series.symbol(), "ACME");
    }

    #[test]
    fn empty_input_gives_empty_series() {
        let series = Deduplicator::combine("ACME", Vec::<Vec<RawBar>>::new());
        assert!(series.is_empty());
    }

    proptest! {
        #[test]
        fn dedup_is_idempotent(
            fragments in proptest::collection::vec(
                proptest::collection::vec((0u32..30, 1.0f64..500.0), 0..20),
                1..5,
            )
        ) {
            let fragments: Vec<Vec<RawBar>> = fragments
                .into_iter()
                .map(|f| f.into_iter().map(|(m, p)| bar("ACME", m, p)).collect())
                .collect();

            let once = Deduplicator::combine("ACME", fragments);
            let twice = Deduplicator::recombine(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
