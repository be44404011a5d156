//! Frame schemas and row <-> DataFrame conversion.
//!
//! Three shapes:
//! - rows: `symbol, timestamp, open, high, low, close, volume` (cache and
//!   scratch files)
//! - minute frame: `datetime, open, high, low, close, volume` (one symbol)
//! - daily frame: `date, open, high, low, close, volume` (one symbol)
//!
//! Datetime columns are millisecond precision and hold UTC instants; the
//! neutral storage timezone is implied rather than attached to the dtype.

use super::error::DataError;
use crate::domain::{DailyBar, RawBar};
use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;

/// Epoch used for `Date` columns (days since).
fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn datetime_ms() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

/// Expected schemas for bar frames.
pub struct BarSchema;

impl BarSchema {
    /// Multi-symbol row schema used by cache artifacts and scratch files.
    pub fn rows() -> Schema {
        Schema::from_iter(vec![
            Field::new("symbol".into(), DataType::String),
            Field::new("timestamp".into(), datetime_ms()),
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::UInt64),
        ])
    }

    /// Per-symbol minute frame handed to the bundle writer.
    pub fn minute() -> Schema {
        Schema::from_iter(vec![
            Field::new("datetime".into(), datetime_ms()),
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::UInt64),
        ])
    }

    /// Per-symbol daily frame handed to the bundle writer.
    pub fn daily() -> Schema {
        Schema::from_iter(vec![
            Field::new("date".into(), DataType::Date),
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::UInt64),
        ])
    }

    /// Validate a DataFrame against an expected schema: every column present
    /// with the expected dtype. Extra columns are allowed.
    pub fn validate(df: &DataFrame, expected: &Schema) -> Result<(), DataError> {
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| DataError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(DataError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        Ok(())
    }
}

fn ohlcv_columns<I>(bars: I) -> [Column; 5]
where
    I: Iterator<Item = (f64, f64, f64, f64, u64)>,
{
    let (mut opens, mut highs, mut lows, mut closes, mut volumes) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
    for (o, h, l, c, v) in bars {
        opens.push(o);
        highs.push(h);
        lows.push(l);
        closes.push(c);
        volumes.push(v);
    }
    [
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ]
}

/// Convert bars (any symbols) to the row schema.
pub fn bars_to_frame(bars: &[RawBar]) -> Result<DataFrame, DataError> {
    let symbols: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
    let timestamps: Vec<i64> = bars.iter().map(|b| b.timestamp_ms()).collect();

    let mut columns = vec![
        Column::new("symbol".into(), symbols),
        Column::new("timestamp".into(), timestamps).cast(&datetime_ms())?,
    ];
    columns.extend(ohlcv_columns(
        bars.iter().map(|b| (b.open, b.high, b.low, b.close, b.volume)),
    ));
    Ok(DataFrame::new(columns)?)
}

/// Convert one symbol's bars to a datetime-indexed minute frame.
pub fn minute_frame(bars: &[RawBar]) -> Result<DataFrame, DataError> {
    let timestamps: Vec<i64> = bars.iter().map(|b| b.timestamp_ms()).collect();
    let mut columns = vec![Column::new("datetime".into(), timestamps).cast(&datetime_ms())?];
    columns.extend(ohlcv_columns(
        bars.iter().map(|b| (b.open, b.high, b.low, b.close, b.volume)),
    ));
    Ok(DataFrame::new(columns)?)
}

/// Convert one symbol's session bars to a date-indexed daily frame.
pub fn daily_frame(bars: &[DailyBar]) -> Result<DataFrame, DataError> {
    let days: Vec<i32> = bars
        .iter()
        .map(|b| (b.date - epoch()).num_days() as i32)
        .collect();
    let mut columns = vec![Column::new("date".into(), days).cast(&DataType::Date)?];
    columns.extend(ohlcv_columns(
        bars.iter().map(|b| (b.open, b.high, b.low, b.close, b.volume)),
    ));
    Ok(DataFrame::new(columns)?)
}

fn column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column, DataError> {
    df.column(name)
        .map_err(|_| DataError::MissingColumn(name.to_string()))
}

/// Read a row-schema frame back into bars, in frame order.
pub fn frame_to_bars(df: &DataFrame) -> Result<Vec<RawBar>, DataError> {
    let symbols = column(df, "symbol")?.str()?;
    // Through Int64 so any datetime unit or raw epoch-ms column reads the same.
    let timestamps = column(df, "timestamp")?
        .cast(&datetime_ms())?
        .cast(&DataType::Int64)?;
    let timestamps = timestamps.i64()?;
    let opens = column(df, "open")?.cast(&DataType::Float64)?;
    let highs = column(df, "high")?.cast(&DataType::Float64)?;
    let lows = column(df, "low")?.cast(&DataType::Float64)?;
    let closes = column(df, "close")?.cast(&DataType::Float64)?;
    let volumes = column(df, "volume")?.cast(&DataType::UInt64)?;
    let (opens, highs, lows, closes, volumes) = (
        opens.f64()?,
        highs.f64()?,
        lows.f64()?,
        closes.f64()?,
        volumes.u64()?,
    );

    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let ms = timestamps
            .get(i)
            .ok_or(DataError::NullValue { column: "timestamp", row: i })?;
        let timestamp: DateTime<Utc> =
            DateTime::from_timestamp_millis(ms).ok_or(DataError::InvalidTimestamp(ms))?;
        bars.push(RawBar {
            symbol: symbols
                .get(i)
                .ok_or(DataError::NullValue { column: "symbol", row: i })?
                .to_string(),
            timestamp,
            open: opens.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            volume: volumes.get(i).unwrap_or(0),
        });
    }
    Ok(bars)
}
