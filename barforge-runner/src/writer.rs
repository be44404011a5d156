//! Bundle writer boundary and the adapter that feeds it.
//!
//! The writer pulls `(sid, frame)` pairs one symbol at a time, so at most one
//! symbol's minute bars are resident while a bundle is written. Sids come out
//! in strictly ascending order on both streams.

use crate::dataset::Dataset;
use crate::error::PipelineError;
use barforge_core::data::{daily_frame, minute_frame, CalendarAligner, DataError};
use barforge_core::domain::{AssetRecord, DailyBar, ExchangeRecord, Sid};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// One symbol's frame on a bar stream.
#[derive(Debug, Clone)]
pub struct SymbolFrame {
    pub sid: Sid,
    pub symbol: String,
    pub frame: DataFrame,
}

/// Pull-based stream of per-symbol frames.
pub type FrameStream<'a> = dyn Iterator<Item = Result<SymbolFrame, PipelineError>> + 'a;

/// Splits and dividends. Always empty here, but carrying the full schema.
#[derive(Debug, Clone)]
pub struct CorporateActions {
    pub splits: DataFrame,
    pub dividends: DataFrame,
}

fn empty_date_column(name: &str) -> Result<Column, PolarsError> {
    Column::new(name.into(), Vec::<i32>::new()).cast(&DataType::Date)
}

impl CorporateActions {
    pub fn empty() -> Result<Self, DataError> {
        let splits = DataFrame::new(vec![
            Column::new("sid".into(), Vec::<u32>::new()),
            empty_date_column("effective_date")?,
            Column::new("ratio".into(), Vec::<f64>::new()),
        ])?;
        let dividends = DataFrame::new(vec![
            Column::new("sid".into(), Vec::<u32>::new()),
            empty_date_column("ex_date")?,
            empty_date_column("declared_date")?,
            empty_date_column("record_date")?,
            empty_date_column("pay_date")?,
            Column::new("amount".into(), Vec::<f64>::new()),
        ])?;
        Ok(Self { splits, dividends })
    }
}

/// Run facts recorded next to a committed bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub calendar: String,
    pub strategy: Option<String>,
    pub symbols: usize,
    pub minute_rows: usize,
    pub daily_rows: usize,
    pub dataset_hash: String,
    pub created_at: DateTime<Utc>,
}

/// The external bundle-writing interface.
///
/// Calls arrive in order: minute bars, daily bars, asset metadata,
/// corporate actions, then `commit`. Any failure is followed by `abort`, and
/// nothing may be visible to consumers until `commit` returns.
pub trait BundleWriter {
    /// Consume the minute stream. Returns rows written.
    fn write_minute_bars(&mut self, bars: &mut FrameStream<'_>) -> Result<usize, PipelineError>;

    /// Consume the daily stream. Returns rows written.
    fn write_daily_bars(&mut self, bars: &mut FrameStream<'_>) -> Result<usize, PipelineError>;

    fn write_asset_metadata(
        &mut self,
        assets: &[AssetRecord],
        exchanges: &[ExchangeRecord],
    ) -> Result<(), PipelineError>;

    fn write_corporate_actions(&mut self, actions: &CorporateActions) -> Result<(), PipelineError>;

    fn commit(&mut self, manifest: &BundleManifest) -> Result<(), PipelineError>;

    /// Discard everything written so far.
    fn abort(&mut self);
}

/// A symbol that survived preparation, with its session bars.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSymbol {
    pub sid: Sid,
    pub symbol: String,
    pub daily: Vec<DailyBar>,
    pub minute_rows: usize,
}

/// Presents prepared symbols to a `BundleWriter` as lazy frame streams.
pub struct BundleWriterAdapter<'a> {
    dataset: &'a Dataset,
    aligner: &'a CalendarAligner,
    prepared: Vec<&'a PreparedSymbol>,
}

impl<'a> BundleWriterAdapter<'a> {
    pub fn new(
        dataset: &'a Dataset,
        aligner: &'a CalendarAligner,
        prepared: &'a [PreparedSymbol],
    ) -> Self {
        let mut prepared: Vec<&PreparedSymbol> = prepared.iter().collect();
        prepared.sort_by_key(|p| p.sid);
        Self {
            dataset,
            aligner,
            prepared,
        }
    }

    /// Minute frames, reloaded and re-aligned per symbol on demand.
    pub fn minute_frames(&self) -> MinuteFrames<'a, '_> {
        MinuteFrames {
            dataset: self.dataset,
            aligner: self.aligner,
            symbols: self.prepared.iter(),
        }
    }

    /// Daily frames from the prepared session bars.
    pub fn daily_frames(&self) -> DailyFrames<'a, '_> {
        DailyFrames {
            symbols: self.prepared.iter(),
        }
    }

    pub fn corporate_actions(&self) -> Result<CorporateActions, PipelineError> {
        Ok(CorporateActions::empty()?)
    }
}

pub struct MinuteFrames<'a, 'b> {
    dataset: &'a Dataset,
    aligner: &'a CalendarAligner,
    symbols: std::slice::Iter<'b, &'a PreparedSymbol>,
}

impl Iterator for MinuteFrames<'_, '_> {
    type Item = Result<SymbolFrame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let prepared = self.symbols.next()?;
        let frame = self
            .dataset
            .load(&prepared.symbol)
            .map(|series| self.aligner.align_minutes(&series).bars)
            .and_then(|bars| minute_frame(&bars).map_err(PipelineError::from));
        trace!(sid = %prepared.sid, symbol = %prepared.symbol, "emitting minute frame");
        Some(frame.map(|frame| SymbolFrame {
            sid: prepared.sid,
            symbol: prepared.symbol.clone(),
            frame,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.symbols.size_hint()
    }
}

pub struct DailyFrames<'a, 'b> {
    symbols: std::slice::Iter<'b, &'a PreparedSymbol>,
}

impl Iterator for DailyFrames<'_, '_> {
    type Item = Result<SymbolFrame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let prepared = self.symbols.next()?;
        Some(
            daily_frame(&prepared.daily)
                .map_err(PipelineError::from)
                .map(|frame| SymbolFrame {
                    sid: prepared.sid,
                    symbol: prepared.symbol.clone(),
                    frame,
                }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.symbols.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::GroupedBars;
    use barforge_core::domain::RawBar;
    use barforge_core::ExchangeCalendar;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Arc;

    fn bar(symbol: &str, h: u32, m: u32) -> RawBar {
        RawBar {
            symbol: symbol.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 8, h, m, 0).unwrap(),
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 5,
        }
    }

    fn prepared(sid: u32, symbol: &str) -> PreparedSymbol {
        PreparedSymbol {
            sid: Sid(sid),
            symbol: symbol.into(),
            daily: vec![DailyBar::carried(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(), 10.5)],
            minute_rows: 1,
        }
    }

    #[test]
    fn streams_ascend_by_sid_and_realign_minutes() {
        let dataset = Dataset::InMemory(GroupedBars::from_rows(vec![
            bar("ACME", 3, 46),
            bar("ACME", 2, 0), // pre-market, dropped on realignment
            bar("ZED", 3, 47),
        ]));
        let day = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let aligner = CalendarAligner::new(Arc::new(ExchangeCalendar::xnse()), day, day);
        let symbols = vec![prepared(1, "ZED"), prepared(0, "ACME")];
        let adapter = BundleWriterAdapter::new(&dataset, &aligner, &symbols);

        let minute: Vec<SymbolFrame> = adapter.minute_frames().collect::<Result<_, _>>().unwrap();
        assert_eq!(minute.iter().map(|f| f.sid).collect::<Vec<_>>(), vec![Sid(0), Sid(1)]);
        assert_eq!(minute[0].frame.height(), 1);

        let daily: Vec<SymbolFrame> = adapter.daily_frames().collect::<Result<_, _>>().unwrap();
        assert_eq!(daily[0].symbol, "ACME");
        assert_eq!(daily[1].frame.height(), 1);
    }

    #[test]
    fn corporate_actions_are_empty_with_schema() {
        let actions = CorporateActions::empty().unwrap();
        assert_eq!(actions.splits.height(), 0);
        assert_eq!(actions.dividends.height(), 0);
        assert!(actions.splits.column("ratio").is_ok());
        assert!(actions.dividends.column("amount").is_ok());
    }
}
