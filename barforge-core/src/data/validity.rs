//! Row-level OHLCV sanity screening.

use crate::domain::{RawBar, SourceRow};
use serde::Serialize;

/// Why a row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The timestamp is missing or could not be resolved.
    BadTimestamp,
    /// One of open/high/low/close is null or NaN.
    MissingPrice,
    /// A price is zero or negative.
    NonPositivePrice,
    /// high < max(open, close, low) or low > min(open, close, high).
    InvertedRange,
    /// Volume is negative or NaN.
    BadVolume,
}

/// Counts of kept and dropped rows, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidityReport {
    pub kept: usize,
    pub bad_timestamp: usize,
    pub missing_price: usize,
    pub non_positive_price: usize,
    pub inverted_range: usize,
    pub bad_volume: usize,
}

impl ValidityReport {
    pub fn dropped(&self) -> usize {
        self.bad_timestamp
            + self.missing_price
            + self.non_positive_price
            + self.inverted_range
            + self.bad_volume
    }

    pub fn merge(&mut self, other: &ValidityReport) {
        self.kept += other.kept;
        self.bad_timestamp += other.bad_timestamp;
        self.missing_price += other.missing_price;
        self.non_positive_price += other.non_positive_price;
        self.inverted_range += other.inverted_range;
        self.bad_volume += other.bad_volume;
    }

    fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::BadTimestamp => self.bad_timestamp += 1,
            Rejection::MissingPrice => self.missing_price += 1,
            Rejection::NonPositivePrice => self.non_positive_price += 1,
            Rejection::InvertedRange => self.inverted_range += 1,
            Rejection::BadVolume => self.bad_volume += 1,
        }
    }
}

/// Drops rows that cannot be real bars.
///
/// Missing volume becomes 0; fractional volume truncates toward zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidityFilter;

impl ValidityFilter {
    /// Screen a single row.
    pub fn screen(row: SourceRow) -> Result<RawBar, Rejection> {
        let timestamp = row.timestamp.ok_or(Rejection::BadTimestamp)?;
        let price = |v: Option<f64>| v.filter(|p| !p.is_nan()).ok_or(Rejection::MissingPrice);
        let open = price(row.open)?;
        let high = price(row.high)?;
        let low = price(row.low)?;
        let close = price(row.close)?;

        if open <= 0.0 || high <= 0.0 || low <= 0.0 || close <= 0.0 {
            return Err(Rejection::NonPositivePrice);
        }
        if high < open.max(close).max(low) || low > open.min(close).min(high) {
            return Err(Rejection::InvertedRange);
        }

        let volume = match row.volume {
            None => 0,
            Some(v) if v.is_nan() || v < 0.0 => return Err(Rejection::BadVolume),
            Some(v) => v.trunc() as u64,
        };

        Ok(RawBar {
            symbol: row.symbol,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Screen a batch, returning the survivors in input order.
    pub fn apply(rows: Vec<SourceRow>) -> (Vec<RawBar>, ValidityReport) {
        let mut report = ValidityReport::default();
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::screen(row) {
                Ok(bar) => kept.push(bar),
                Err(rejection) => report.record(rejection),
            }
        }
        report.kept = kept.len();
        (kept, report)
    }
}
