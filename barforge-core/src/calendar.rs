//! Trading calendars: sessions and session-minutes.
//!
//! `TradingCalendar` is the boundary to whatever calendar implementation the
//! bundle consumer uses. `ExchangeCalendar` is a plain configurable
//! implementation: fixed weekly weekend, explicit holiday list, regular
//! trading hours in an IANA timezone, optional early closes.
//!
//! Minutes follow the bar-close labeling convention: a session open at 09:15
//! and closing at 15:30 has minutes 09:16 ..= 15:30 local time.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Read-only view of a trading calendar.
pub trait TradingCalendar: Send + Sync {
    /// Short calendar name, e.g. `XNSE`.
    fn name(&self) -> &str;

    /// Exchange-local timezone used to label sessions.
    fn timezone(&self) -> Tz;

    /// True if `date` is a trading session.
    fn is_session(&self, date: NaiveDate) -> bool;

    /// Valid minutes for `session`, in UTC, ascending. Empty for non-sessions.
    fn session_minutes(&self, session: NaiveDate) -> Vec<DateTime<Utc>>;

    /// All sessions in `[start, end]`, ascending.
    fn sessions_in_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| self.is_session(*d))
            .collect()
    }

    /// Every session-minute of every session in `[start, end]`, ascending.
    fn minutes_for_sessions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<DateTime<Utc>> {
        self.sessions_in_range(start, end)
            .into_iter()
            .flat_map(|s| self.session_minutes(s))
            .collect()
    }

    /// Exchange-local calendar date of a UTC instant.
    fn session_label(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.timezone()).date_naive()
    }
}

/// Configurable weekday/holiday calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCalendar {
    pub name: String,
    pub timezone: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
    #[serde(default = "default_weekend")]
    pub weekend: Vec<Weekday>,
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub early_closes: BTreeMap<NaiveDate, NaiveTime>,
}

fn default_weekend() -> Vec<Weekday> {
    vec![Weekday::Sat, Weekday::Sun]
}

impl ExchangeCalendar {
    pub fn new(name: impl Into<String>, timezone: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            name: name.into(),
            timezone,
            open,
            close,
            weekend: default_weekend(),
            holidays: BTreeSet::new(),
            early_closes: BTreeMap::new(),
        }
    }

    /// National Stock Exchange of India regular hours (09:15-15:30 IST).
    pub fn xnse() -> Self {
        Self::new(
            "XNSE",
            chrono_tz::Asia::Kolkata,
            NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
        )
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn with_early_close(mut self, date: NaiveDate, close: NaiveTime) -> Self {
        self.early_closes.insert(date, close);
        self
    }

    fn close_for(&self, session: NaiveDate) -> NaiveTime {
        self.early_closes.get(&session).copied().unwrap_or(self.close)
    }
}

impl TradingCalendar for ExchangeCalendar {
    fn name(&self) -> &str {
        &self.name
    }

    fn timezone(&self) -> Tz {
        self.timezone
    }

    fn is_session(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        !self.weekend.contains(&date.weekday()) && !self.holidays.contains(&date)
    }

    fn session_minutes(&self, session: NaiveDate) -> Vec<DateTime<Utc>> {
        if !self.is_session(session) {
            return Vec::new();
        }
        let open = session.and_time(self.open);
        let close = session.and_time(self.close_for(session));

        let mut minutes = Vec::new();
        let mut local = open + Duration::minutes(1);
        while local <= close {
            // Nonexistent local times (DST gaps) have no minute.
            if let Some(ts) = self.timezone.from_local_datetime(&local).earliest() {
                minutes.push(ts.with_timezone(&Utc));
            }
            local += Duration::minutes(1);
        }
        minutes
    }
}
