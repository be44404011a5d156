//! Calendar alignment: session-minute filtering and daily resampling.
//!
//! Minute path: bars whose UTC timestamp is not a valid session-minute in the
//! dataset's session range are dropped (pre/post market prints, holidays).
//!
//! Daily path: minute bars are bucketed by exchange-local date, aggregated
//! (first open, max high, min low, last close, summed volume), non-session
//! buckets are dropped, and the result is reindexed over every session between
//! the symbol's first and last traded session. Gap sessions carry the previous
//! close forward with volume exactly 0.

use crate::calendar::TradingCalendar;
use crate::domain::{DailyBar, RawBar, SymbolSeries};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Result of filtering one series to session-minutes.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteAlignment {
    pub bars: Vec<RawBar>,
    pub dropped: usize,
}

/// Aligns series to a trading calendar over a fixed session range.
pub struct CalendarAligner {
    calendar: Arc<dyn TradingCalendar>,
    first_session: NaiveDate,
    last_session: NaiveDate,
    minutes: HashSet<i64>,
}

impl std::fmt::Debug for CalendarAligner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarAligner")
            .field("calendar", &self.calendar.name())
            .field("first_session", &self.first_session)
            .field("last_session", &self.last_session)
            .field("minutes", &self.minutes.len())
            .finish()
    }
}

impl CalendarAligner {
    /// Precompute the valid session-minutes for `[first_session, last_session]`.
    pub fn new(
        calendar: Arc<dyn TradingCalendar>,
        first_session: NaiveDate,
        last_session: NaiveDate,
    ) -> Self {
        let minutes = calendar
            .minutes_for_sessions_in_range(first_session, last_session)
            .into_iter()
            .map(|ts| ts.timestamp_millis())
            .collect::<HashSet<i64>>();
        debug!(
            calendar = calendar.name(),
            %first_session,
            %last_session,
            minutes = minutes.len(),
            "precomputed session-minutes"
        );
        Self {
            calendar,
            first_session,
            last_session,
            minutes,
        }
    }

    /// Build an aligner covering the dataset's overall time bounds.
    pub fn for_bounds(
        calendar: Arc<dyn TradingCalendar>,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Self {
        let first = calendar.session_label(earliest);
        let last = calendar.session_label(latest);
        Self::new(calendar, first, last)
    }

    pub fn calendar(&self) -> &dyn TradingCalendar {
        self.calendar.as_ref()
    }

    pub fn session_range(&self) -> (NaiveDate, NaiveDate) {
        (self.first_session, self.last_session)
    }

    /// Number of valid session-minutes in range.
    pub fn minute_count(&self) -> usize {
        self.minutes.len()
    }

    pub fn is_session_minute(&self, ts: DateTime<Utc>) -> bool {
        self.minutes.contains(&ts.timestamp_millis())
    }

    /// Keep only bars that land on a valid session-minute.
    pub fn align_minutes(&self, series: &SymbolSeries) -> MinuteAlignment {
        let bars: Vec<RawBar> = series
            .bars()
            .iter()
            .filter(|b| self.minutes.contains(&b.timestamp_ms()))
            .cloned()
            .collect();
        MinuteAlignment {
            dropped: series.len() - bars.len(),
            bars,
        }
    }

    /// Resample minute bars into session bars with forward-filled gaps.
    ///
    /// `minutes` must be ascending by timestamp (aligned output is).
    pub fn resample_daily(&self, minutes: &[RawBar]) -> Vec<DailyBar> {
        let mut buckets: BTreeMap<NaiveDate, DailyBar> = BTreeMap::new();
        for bar in minutes {
            let date = self.calendar.session_label(bar.timestamp);
            buckets
                .entry(date)
                .and_modify(|d| {
                    d.high = d.high.max(bar.high);
                    d.low = d.low.min(bar.low);
                    d.close = bar.close;
                    d.volume += bar.volume;
                })
                .or_insert_with(|| DailyBar {
                    date,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                });
        }
        buckets.retain(|date, _| self.calendar.is_session(*date));

        let (Some(&first), Some(&last)) = (buckets.keys().next(), buckets.keys().next_back())
        else {
            return Vec::new();
        };

        let mut daily = Vec::new();
        let mut prev_close: Option<f64> = None;
        for session in self.calendar.sessions_in_range(first, last) {
            let bar = match buckets.remove(&session) {
                Some(bar) => bar,
                None => match prev_close {
                    Some(close) => DailyBar::carried(session, close),
                    None => continue,
                },
            };
            prev_close = Some(bar.close);
            daily.push(bar);
        }
        daily
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ExchangeCalendar;
    use crate::data::Deduplicator;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// Bar at the given IST wall-clock time.
    fn ist_bar(date: NaiveDate, h: u32, m: u32, close: f64, volume: u64) -> RawBar {
        let local = date.and_hms_opt(h, m, 0).unwrap();
        let ts = chrono_tz::Asia::Kolkata
            .from_local_datetime(&local)
            .unwrap()
            .with_timezone(&Utc);
        RawBar {
            symbol: "ACME".into(),
            timestamp: ts,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    fn aligner(first: NaiveDate, last: NaiveDate) -> CalendarAligner {
        CalendarAligner::new(Arc::new(ExchangeCalendar::xnse()), first, last)
    }

    #[test]
    fn drops_pre_market_post_market_and_holiday_bars() {
        let mon = d(2024, 1, 8);
        let sat = d(2024, 1, 13);
        let series = Deduplicator::combine(
            "ACME",
            [vec![
                ist_bar(mon, 9, 0, 100.0, 1),   // pre-market
                ist_bar(mon, 9, 15, 100.0, 1),  // open print, not a bar close
                ist_bar(mon, 9, 16, 100.0, 1),  // first session-minute
                ist_bar(mon, 15, 30, 100.0, 1), // last session-minute
                ist_bar(mon, 15, 45, 100.0, 1), // post-market
                ist_bar(sat, 10, 0, 100.0, 1),  // weekend
            ]],
        );

        let aligned = aligner(mon, sat).align_minutes(&series);

        assert_eq!(aligned.bars.len(), 2);
        assert_eq!(aligned.dropped, 4);
    }

    #[test]
    fn daily_aggregates_ohlcv_per_session() {
        let mon = d(2024, 1, 8);
        let minutes = vec![
            ist_bar(mon, 9, 16, 100.0, 10),
            ist_bar(mon, 9, 17, 104.0, 20),
            ist_bar(mon, 9, 18, 98.0, 30),
        ];

        let daily = aligner(mon, mon).resample_daily(&minutes);

        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].date, mon);
        assert_eq!(daily[0].open, 99.5);
        assert_eq!(daily[0].high, 105.0);
        assert_eq!(daily[0].low, 97.0);
        assert_eq!(daily[0].close, 98.0);
        assert_eq!(daily[0].volume, 60);
    }

    #[test]
    fn gap_session_carries_prior_close_with_zero_volume() {
        let (mon, tue, wed) = (d(2024, 1, 8), d(2024, 1, 9), d(2024, 1, 10));
        let minutes = vec![
            ist_bar(mon, 9, 16, 100.0, 10),
            ist_bar(mon, 15, 30, 102.0, 10),
            ist_bar(wed, 9, 16, 110.0, 5),
        ];

        let daily = aligner(mon, wed).resample_daily(&minutes);

        assert_eq!(daily.len(), 3);
        assert_eq!(daily[1].date, tue);
        assert_eq!(daily[1].close, daily[0].close);
        assert_eq!(daily[1].open, 102.0);
        assert_eq!(daily[1].high, 102.0);
        assert_eq!(daily[1].low, 102.0);
        assert_eq!(daily[1].volume, 0);
        assert_eq!(daily[2].volume, 5);
    }

    #[test]
    fn reindex_skips_weekends() {
        let (fri, mon) = (d(2024, 1, 12), d(2024, 1, 15));
        let minutes = vec![ist_bar(fri, 9, 16, 100.0, 1), ist_bar(mon, 9, 16, 101.0, 1)];

        let daily = aligner(fri, mon).resample_daily(&minutes);

        let dates: Vec<_> = daily.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![fri, mon]);
    }

    #[test]
    fn daily_volume_equals_minute_sum() {
        let mon = d(2024, 1, 8);
        let minutes: Vec<RawBar> = (0..60)
            .map(|i| ist_bar(mon, 9 + (16 + i) / 60, (16 + i) % 60, 100.0, i as u64 + 1))
            .collect();
        let total: u64 = minutes.iter().map(|b| b.volume).sum();

        let daily = aligner(mon, mon).resample_daily(&minutes);

        assert_eq!(daily[0].volume, total);
    }

    #[test]
    fn empty_input_gives_empty_daily() {
        let mon = d(2024, 1, 8);
        assert!(aligner(mon, mon).resample_daily(&[]).is_empty());
    }

    #[test]
    fn for_bounds_labels_sessions_in_exchange_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 8, 3, 46, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap();
        let aligner =
            CalendarAligner::for_bounds(Arc::new(ExchangeCalendar::xnse()), start, end);
        assert_eq!(aligner.session_range(), (d(2024, 1, 8), d(2024, 1, 10)));
        assert_eq!(aligner.minute_count(), 3 * 375);
    }
}
