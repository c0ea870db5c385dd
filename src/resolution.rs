//! Candle bucket widths and the time arithmetic built on them.
//!
//! Minute-based resolutions have a constant width and floor in the
//! timestamp's own offset. Day, week and month buckets follow the calendar
//! of the timestamp's timezone: they start at midnight (weeks on Monday,
//! months on the 1st) and end at the next bucket's midnight, so a day
//! containing a daylight-saving switch lasts 23 or 25 hours. Provider
//! timestamps are UTC, which makes their buckets UTC buckets.
//!
//! "Candle units" are a continuous coordinate (bucket index since epoch plus
//! the elapsed fraction of the bucket) used to put irregular buckets on a
//! linear chart axis.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Offset, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::ChartfeedError;

/// Width of a single candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CandleResolution {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Minute60,
    Day,
    Week,
    Month,
}

impl CandleResolution {
    /// Every resolution, narrowest first.
    pub const ALL: [CandleResolution; 8] = [
        Self::Minute1,
        Self::Minute5,
        Self::Minute15,
        Self::Minute30,
        Self::Minute60,
        Self::Day,
        Self::Week,
        Self::Month,
    ];

    /// Stable code used in persisted configuration.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Minute1 => 0,
            Self::Minute5 => 1,
            Self::Minute15 => 2,
            Self::Minute30 => 3,
            Self::Minute60 => 4,
            Self::Day => 5,
            Self::Week => 6,
            Self::Month => 7,
        }
    }

    /// Human-facing label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute1 => "1 min",
            Self::Minute5 => "5 min",
            Self::Minute15 => "15 min",
            Self::Minute30 => "30 min",
            Self::Minute60 => "60 min",
            Self::Day => "1 day",
            Self::Week => "1 week",
            Self::Month => "1 month",
        }
    }

    /// Alpaca `timeframe` query value.
    #[must_use]
    pub fn alpaca_timeframe(self) -> &'static str {
        match self {
            Self::Minute1 => "1Min",
            Self::Minute5 => "5Min",
            Self::Minute15 => "15Min",
            Self::Minute30 => "30Min",
            Self::Minute60 => "1Hour",
            Self::Day => "1Day",
            Self::Week => "1Week",
            Self::Month => "1Month",
        }
    }

    /// Finnhub `resolution` query value.
    #[must_use]
    pub fn finnhub_resolution(self) -> &'static str {
        match self {
            Self::Minute1 => "1",
            Self::Minute5 => "5",
            Self::Minute15 => "15",
            Self::Minute30 => "30",
            Self::Minute60 => "60",
            Self::Day => "D",
            Self::Week => "W",
            Self::Month => "M",
        }
    }

    /// Bucket width in minutes for the fixed-width resolutions.
    fn minutes(self) -> Option<i64> {
        match self {
            Self::Minute1 => Some(1),
            Self::Minute5 => Some(5),
            Self::Minute15 => Some(15),
            Self::Minute30 => Some(30),
            Self::Minute60 => Some(60),
            Self::Day | Self::Week | Self::Month => None,
        }
    }

    /// Wall-clock duration of the bucket containing `t`, measured in `t`'s
    /// timezone.
    pub fn get_duration<Tz: TimeZone>(self, t: &DateTime<Tz>) -> TimeDelta {
        if let Some(minutes) = self.minutes() {
            return TimeDelta::minutes(minutes);
        }

        let tz = t.timezone();
        let start = self.bucket_start_date(t.date_naive());
        let next = self.next_bucket_date(start);
        local_midnight(&tz, next) - local_midnight(&tz, start)
    }

    /// Start of the bucket containing `t`.
    ///
    /// Calendar buckets floor to midnight, Monday or the 1st of the month
    /// on `t`'s own calendar, so a UTC timestamp gets a UTC bucket.
    pub fn get_recent_candle_start_time<Tz: TimeZone>(self, t: &DateTime<Tz>) -> DateTime<Tz> {
        match self.minutes() {
            Some(minutes) => {
                let width = minutes * 60;
                let offset = i64::from(t.offset().fix().local_minus_utc());
                let into_bucket = (t.timestamp() + offset).rem_euclid(width);
                t.clone()
                    - TimeDelta::seconds(into_bucket)
                    - TimeDelta::nanoseconds(i64::from(t.timestamp_subsec_nanos()))
            }
            None => local_midnight(&t.timezone(), self.bucket_start_date(t.date_naive())),
        }
    }

    /// Start of the bucket `n` buckets away from the one containing `t`.
    ///
    /// Stepping back measures the preceding bucket, since calendar buckets
    /// differ in width.
    pub fn get_nth_candle_time<Tz: TimeZone>(self, t: &DateTime<Tz>, n: i64) -> DateTime<Tz> {
        let start = self.get_recent_candle_start_time(t);
        if let Some(minutes) = self.minutes() {
            return start + TimeDelta::minutes(minutes * n);
        }

        let mut current = start;
        if n >= 0 {
            for _ in 0..n {
                let width = self.get_duration(&current);
                current = current + width;
            }
        } else {
            for _ in 0..n.unsigned_abs() {
                let width = self.get_duration(&(current.clone() - TimeDelta::seconds(1)));
                current = current - width;
            }
        }
        current
    }

    /// Number of buckets from the one containing `candle_time` to the one
    /// containing `trade_time`: `0` for the same bucket, `-1` when the trade
    /// is older than the candle.
    pub fn get_delta_candle_count<Tz: TimeZone>(
        self,
        candle_time: &DateTime<Tz>,
        trade_time: &DateTime<Tz>,
    ) -> i64 {
        if trade_time < candle_time {
            return -1;
        }

        match self.minutes() {
            Some(minutes) => {
                let candle_start = self.get_recent_candle_start_time(candle_time);
                let trade_start = self.get_recent_candle_start_time(trade_time);
                (trade_start - candle_start).num_seconds() / (minutes * 60)
            }
            None => {
                self.calendar_index(trade_time.date_naive())
                    - self.calendar_index(candle_time.date_naive())
            }
        }
    }

    /// Fractional bucket index of `t` since the resolution's epoch.
    pub fn convert_time_to_candle_units<Tz: TimeZone>(self, t: &DateTime<Tz>) -> f64 {
        let t = t.with_timezone(&Utc);
        match self.minutes() {
            Some(minutes) => t.timestamp_millis() as f64 / (minutes * 60_000) as f64,
            None => {
                let index = self.calendar_index(t.date_naive());
                let start = self.calendar_start(index);
                let width = self.calendar_start(index + 1) - start;
                let elapsed = t - start;
                index as f64 + elapsed.num_milliseconds() as f64 / width.num_milliseconds() as f64
            }
        }
    }

    /// Inverse of [`convert_time_to_candle_units`](Self::convert_time_to_candle_units),
    /// exact to the millisecond.
    pub fn convert_candle_units_to_time(self, units: f64) -> DateTime<Utc> {
        match self.minutes() {
            Some(minutes) => {
                let millis = (units * (minutes * 60_000) as f64).round() as i64;
                DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(millis)
            }
            None => {
                let index = units.floor() as i64;
                let start = self.calendar_start(index);
                let width = self.calendar_start(index + 1) - start;
                let offset = ((units - index as f64) * width.num_milliseconds() as f64).round();
                start + TimeDelta::milliseconds(offset as i64)
            }
        }
    }

    /// First calendar date of the bucket containing `date`.
    fn bucket_start_date(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Week => {
                date - TimeDelta::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Self::Month => date.with_day(1).unwrap_or(date),
            Self::Day
            | Self::Minute1
            | Self::Minute5
            | Self::Minute15
            | Self::Minute30
            | Self::Minute60 => date,
        }
    }

    /// First calendar date of the bucket after the one starting on `start`.
    fn next_bucket_date(self, start: NaiveDate) -> NaiveDate {
        match self {
            Self::Week => start
                .checked_add_signed(TimeDelta::days(7))
                .unwrap_or(NaiveDate::MAX),
            Self::Month => {
                month_first_day(self.calendar_index(start) + 1).unwrap_or(NaiveDate::MAX)
            }
            Self::Day
            | Self::Minute1
            | Self::Minute5
            | Self::Minute15
            | Self::Minute30
            | Self::Minute60 => start.succ_opt().unwrap_or(NaiveDate::MAX),
        }
    }

    /// Calendar bucket index of `date` since epoch. Weeks count from Monday
    /// 1970-01-05.
    fn calendar_index(self, date: NaiveDate) -> i64 {
        let days = (date - DateTime::<Utc>::UNIX_EPOCH.date_naive()).num_days();
        match self {
            Self::Week => (days - WEEK_EPOCH_OFFSET_DAYS).div_euclid(7),
            Self::Month => (i64::from(date.year()) - 1970) * 12 + i64::from(date.month0()),
            // Minute resolutions never reach calendar arithmetic; days are
            // the natural index for them anyway.
            Self::Day
            | Self::Minute1
            | Self::Minute5
            | Self::Minute15
            | Self::Minute30
            | Self::Minute60 => days,
        }
    }

    /// UTC start of the calendar bucket with the given index.
    fn calendar_start(self, index: i64) -> DateTime<Utc> {
        match self {
            Self::Week => {
                DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(WEEK_EPOCH_OFFSET_DAYS + index * 7)
            }
            Self::Month => month_first_day(index)
                .map_or(DateTime::<Utc>::MAX_UTC, |date| {
                    date.and_time(NaiveTime::MIN).and_utc()
                }),
            Self::Day
            | Self::Minute1
            | Self::Minute5
            | Self::Minute15
            | Self::Minute30
            | Self::Minute60 => DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(index),
        }
    }
}

/// 1970-01-01 was a Thursday; the first Monday is four days later.
const WEEK_EPOCH_OFFSET_DAYS: i64 = 4;

fn month_first_day(index: i64) -> Option<NaiveDate> {
    let year = i32::try_from(1970 + index.div_euclid(12)).ok()?;
    let month = index.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// First instant of `date` in `tz`. Zones that skip midnight on a DST
/// switch start the day at 01:00.
fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            let one_am = date.and_hms_opt(1, 0, 0)?;
            tz.from_local_datetime(&one_am).earliest()
        })
        .unwrap_or_else(|| midnight.and_utc().with_timezone(tz))
}

impl fmt::Display for CandleResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandleResolution {
    type Err = ChartfeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ChartfeedError::UnknownResolution(s.to_string()))
    }
}

impl TryFrom<u8> for CandleResolution {
    type Error = ChartfeedError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|r| r.code() == code)
            .ok_or_else(|| ChartfeedError::UnknownResolution(code.to_string()))
    }
}

impl From<CandleResolution> for u8 {
    fn from(resolution: CandleResolution) -> Self {
        resolution.code()
    }
}
