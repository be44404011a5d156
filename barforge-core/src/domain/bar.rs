//! Bars: the fundamental market data units flowing through ingestion.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A row exactly as a source produced it, before validity screening.
///
/// Every field but the symbol is nullable because flat files and tables
/// routinely carry holes. The reader resolves the timestamp from the source
/// timezone to UTC; `None` when it is null, unparseable, or falls in a DST gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub symbol: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

/// Clean OHLCV minute bar for a single symbol.
///
/// Timestamps are stored in UTC, the neutral storage timezone. Volume is an
/// integer once a row has passed the validity filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl RawBar {
    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// OHLC sanity: positive prices, high above everything, low below everything.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.high >= self.open.max(self.close).max(self.low)
            && self.low <= self.open.min(self.close).min(self.high)
    }

    /// Epoch milliseconds of the bar timestamp.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Session-level bar produced by daily resampling.
///
/// Dates are timezone-naive. A bar with `volume == 0` and all prices equal to
/// the prior close is a synthetic gap-fill session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl DailyBar {
    /// Synthetic bar carrying `close` forward with zero volume.
    pub fn carried(date: NaiveDate, close: f64) -> Self {
        Self {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0,
        }
    }
}

/// Ordered minute bars for one normalized symbol.
///
/// Built only by the deduplicator, so timestamps are strictly increasing and
/// unique. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSeries {
    symbol: String,
    bars: Vec<RawBar>,
}

impl SymbolSeries {
    pub(crate) fn from_sorted_unique(symbol: String, bars: Vec<RawBar>) -> Self {
        debug_assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        Self { symbol, bars }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars(&self) -> &[RawBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&RawBar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&RawBar> {
        self.bars.last()
    }

    pub fn into_bars(self) -> Vec<RawBar> {
        self.bars
    }
}
