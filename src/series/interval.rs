//! Interval specifications and DST-aware time bucketing.
//!
//! Minute buckets are aligned on the Unix epoch. Day, month and year buckets
//! follow local wall-clock time and are keyed at local noon, which keeps a
//! bucket key on the right calendar day whichever way a DST shift goes.

use chrono::{
    DateTime, Datelike, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone,
    Timelike, Utc,
};
use chrono_tz::{OffsetComponents, Tz};
use core::fmt;
use std::error::Error;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalError {
    Malformed(String),
    Unsupported(String),
}

impl fmt::Display for IntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalError::Malformed(s) => {
                write!(f, "malformed interval '{}': expected <count>-<minutes|days|months>", s)
            }
            IntervalError::Unsupported(s) => write!(f, "unsupported interval '{}'", s),
        }
    }
}

impl Error for IntervalError {}

/// Reporting interval requested by a caller, e.g. `"5-minutes"` or `"1-days"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IntervalSpec {
    Minutes(u32),
    Days,
    Months,
}

/// Destination granularity of the rollup pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Day,
    Month,
    Year,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BucketSize {
    Minutes(u32),
    Days,
    Months,
    Years,
}

impl FromStr for IntervalSpec {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .split_once('-')
            .ok_or_else(|| IntervalError::Malformed(s.to_string()))?;
        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IntervalError::Malformed(s.to_string()));
        }
        let count: u32 = count.parse().map_err(|_| IntervalError::Malformed(s.to_string()))?;
        if count == 0 {
            return Err(IntervalError::Malformed(s.to_string()));
        }

        match unit {
            "minutes" if count <= 60 && 60 % count == 0 => Ok(IntervalSpec::Minutes(count)),
            "days" if count == 1 => Ok(IntervalSpec::Days),
            "months" if count == 1 => Ok(IntervalSpec::Months),
            "minutes" | "days" | "months" => Err(IntervalError::Unsupported(s.to_string())),
            _ => Err(IntervalError::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalSpec::Minutes(n) => write!(f, "{}-minutes", n),
            IntervalSpec::Days => write!(f, "1-days"),
            IntervalSpec::Months => write!(f, "1-months"),
        }
    }
}

impl serde::Serialize for IntervalSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl IntervalSpec {
    fn size(self) -> BucketSize {
        match self {
            IntervalSpec::Minutes(n) => BucketSize::Minutes(n),
            IntervalSpec::Days => BucketSize::Days,
            IntervalSpec::Months => BucketSize::Months,
        }
    }
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Day, Granularity::Month, Granularity::Year];

    fn size(self) -> BucketSize {
        match self {
            Granularity::Day => BucketSize::Days,
            Granularity::Month => BucketSize::Months,
            Granularity::Year => BucketSize::Years,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// Share of a bucket the latest reading must have passed for the bucket to count as complete.
    pub fn completeness_threshold(self) -> f64 {
        match self {
            Granularity::Day => 0.625,
            Granularity::Month => 0.98,
            Granularity::Year => 0.83,
        }
    }

    pub fn floor(self, ts: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
        floor(ts, self.size(), tz)
    }

    pub fn advance(self, ts: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
        advance(ts, self.size(), tz)
    }

    pub fn is_complete(self, latest: DateTime<Utc>, tz: &Tz) -> bool {
        is_greater_than_resolution_fraction(self, self.completeness_threshold(), latest, tz)
    }
}

/// An interval spec bound to the time zone its day/month buckets follow.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Bucketing {
    pub spec: IntervalSpec,
    pub tz: Tz,
}

impl Bucketing {
    pub fn new(spec: IntervalSpec, tz: Tz) -> Self {
        Bucketing { spec, tz }
    }

    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        floor(ts, self.spec.size(), &self.tz)
    }

    pub fn advance(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        advance(ts, self.spec.size(), &self.tz)
    }

    /// Bucket keys covering `[start, end)`.
    pub fn timeline(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut keys = Vec::new();
        let mut key = self.floor(start);
        while key < end {
            keys.push(key);
            key = self.advance(key);
        }
        keys
    }
}

fn floor(ts: DateTime<Utc>, size: BucketSize, tz: &Tz) -> DateTime<Utc> {
    match size {
        BucketSize::Minutes(n) => {
            let step = i64::from(n) * 60;
            let secs = ts.timestamp();
            let excess = TimeDelta::seconds(secs - secs.div_euclid(step) * step)
                + TimeDelta::nanoseconds(i64::from(ts.timestamp_subsec_nanos()));
            ts - excess
        }
        BucketSize::Days => local_noon(local_date(ts, tz), tz),
        BucketSize::Months => {
            let date = local_date(ts, tz);
            local_noon(date.with_day(1).unwrap_or(date), tz)
        }
        BucketSize::Years => {
            let date = local_date(ts, tz);
            local_noon(date.with_ordinal(1).unwrap_or(date), tz)
        }
    }
}

fn advance(ts: DateTime<Utc>, size: BucketSize, tz: &Tz) -> DateTime<Utc> {
    match size {
        BucketSize::Minutes(n) => ts + TimeDelta::minutes(i64::from(n)),
        BucketSize::Days => adjust_for_dst(ts, ts + TimeDelta::days(1), tz),
        BucketSize::Months => adjust_for_dst(ts, add_months_anchored(ts, 1), tz),
        BucketSize::Years => adjust_for_dst(ts, add_months_anchored(ts, 12), tz),
    }
}

fn local_date(ts: DateTime<Utc>, tz: &Tz) -> NaiveDate {
    ts.with_timezone(tz).date_naive()
}

fn local_noon(date: NaiveDate, tz: &Tz) -> DateTime<Utc> {
    from_local(date.and_time(NaiveTime::MIN) + TimeDelta::hours(12), tz)
}

fn from_local(naive: NaiveDateTime, tz: &Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // skipped wall-clock time: read it with the offset in force around it
            let offset = tz.offset_from_utc_datetime(&naive).fix();
            Utc.from_utc_datetime(&(naive - TimeDelta::seconds(i64::from(offset.local_minus_utc()))))
        }
    }
}

pub fn is_daylight_saving_time(ts: DateTime<Utc>, tz: &Tz) -> bool {
    tz.offset_from_utc_datetime(&ts.naive_utc()).dst_offset() != TimeDelta::zero()
}

/// Re-align a naively advanced instant to the wall clock of `previous`.
fn adjust_for_dst(previous: DateTime<Utc>, candidate: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    match (is_daylight_saving_time(previous, tz), is_daylight_saving_time(candidate, tz)) {
        (true, false) => candidate + TimeDelta::hours(1),
        (false, true) => candidate - TimeDelta::hours(1),
        _ => candidate,
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)?
        .checked_add_months(Months::new(1))?
        .pred_opt()
}

/// Calendar month addition where the last day of a month maps to the last day
/// of the target month; other days are clamped to the target month's length.
pub fn add_months_to_date(date: NaiveDate, months: u32) -> NaiveDate {
    let is_last_day = last_day_of_month(date.year(), date.month()) == Some(date);
    let Some(first_of_target) = date.with_day(1).and_then(|d| d.checked_add_months(Months::new(months))) else {
        return NaiveDate::MAX;
    };
    let Some(last_of_target) = last_day_of_month(first_of_target.year(), first_of_target.month()) else {
        return NaiveDate::MAX;
    };
    if is_last_day {
        last_of_target
    } else {
        first_of_target
            .with_day(date.day().min(last_of_target.day()))
            .unwrap_or(last_of_target)
    }
}

fn add_months_anchored(ts: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let naive = ts.naive_utc();
    add_months_to_date(naive.date(), months).and_time(naive.time()).and_utc()
}

/// Whether `ts` lies past `fraction` of its local day, month or year.
pub fn is_greater_than_resolution_fraction(granularity: Granularity, fraction: f64, ts: DateTime<Utc>, tz: &Tz) -> bool {
    let local = ts.with_timezone(tz).naive_local();
    let day_fraction = f64::from(local.time().num_seconds_from_midnight()) / 86_400.0;
    let elapsed = match granularity {
        Granularity::Day => day_fraction,
        Granularity::Month => {
            let days = last_day_of_month(local.year(), local.month()).map_or(31, |d| d.day());
            (f64::from(local.day0()) + day_fraction) / f64::from(days)
        }
        Granularity::Year => {
            let days = if NaiveDate::from_ymd_opt(local.year(), 2, 29).is_some() { 366 } else { 365 };
            (f64::from(local.ordinal0()) + day_fraction) / f64::from(days)
        }
    };
    elapsed > fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Copenhagen;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Copenhagen.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().with_timezone(&Utc)
    }

    fn samples() -> Vec<DateTime<Utc>> {
        vec![
            local(2024, 1, 1, 0, 0),
            local(2024, 1, 31, 23, 59),
            local(2024, 3, 30, 23, 58),
            local(2024, 3, 31, 1, 30),
            local(2024, 3, 31, 4, 0),
            local(2024, 6, 15, 11, 59),
            local(2024, 10, 27, 0, 30),
            local(2024, 10, 27, 4, 0),
            local(2024, 12, 31, 23, 59),
            Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 10, 27, 1, 30, 0).unwrap(),
        ]
    }

    #[test]
    fn parses_interval_specs() {
        assert_eq!("5-minutes".parse::<IntervalSpec>(), Ok(IntervalSpec::Minutes(5)));
        assert_eq!("60-minutes".parse::<IntervalSpec>(), Ok(IntervalSpec::Minutes(60)));
        assert_eq!("1-days".parse::<IntervalSpec>(), Ok(IntervalSpec::Days));
        assert_eq!("1-months".parse::<IntervalSpec>(), Ok(IntervalSpec::Months));
        assert_eq!(IntervalSpec::Minutes(15).to_string(), "15-minutes");
    }

    #[test]
    fn rejects_invalid_interval_specs() {
        for bad in ["", "5", "-minutes", "0-minutes", "x-days", "5-hours", "+5-minutes", "5-minutes-1"] {
            assert!(
                matches!(bad.parse::<IntervalSpec>(), Err(IntervalError::Malformed(_))),
                "accepted {bad:?}"
            );
        }
        for unsupported in ["7-minutes", "90-minutes", "120-minutes", "2-days", "3-months"] {
            assert!(
                matches!(unsupported.parse::<IntervalSpec>(), Err(IntervalError::Unsupported(_))),
                "accepted {unsupported:?}"
            );
        }
    }

    #[test]
    fn floor_is_idempotent() {
        for spec in [IntervalSpec::Minutes(5), IntervalSpec::Minutes(60), IntervalSpec::Days, IntervalSpec::Months] {
            let b = Bucketing::new(spec, Copenhagen);
            for t in samples() {
                assert_eq!(b.floor(b.floor(t)), b.floor(t), "{spec} at {t}");
            }
        }
        for g in Granularity::ALL {
            for t in samples() {
                assert_eq!(g.floor(g.floor(t, &Copenhagen), &Copenhagen), g.floor(t, &Copenhagen));
            }
        }
    }

    #[test]
    fn minute_buckets_contain_their_timestamps() {
        for n in [1, 5, 10, 15, 30, 60] {
            let b = Bucketing::new(IntervalSpec::Minutes(n), Copenhagen);
            for t in samples() {
                let t = t + TimeDelta::milliseconds(1500);
                let key = b.floor(t);
                assert!(key <= t && t < b.advance(key), "{n}-minutes at {t}");
                assert_eq!(key.timestamp() % (i64::from(n) * 60), 0);
            }
        }
    }

    #[test]
    fn day_buckets_are_keyed_at_local_noon_of_the_same_day() {
        let b = Bucketing::new(IntervalSpec::Days, Copenhagen);
        for t in samples() {
            let key = b.floor(t).with_timezone(&Copenhagen);
            assert_eq!(key.date_naive(), t.with_timezone(&Copenhagen).date_naive());
            assert_eq!((key.hour(), key.minute()), (12, 0));
        }
    }

    #[test]
    fn readings_fall_within_the_local_calendar_day_of_their_bucket() {
        let b = Bucketing::new(IntervalSpec::Days, Copenhagen);
        for t in samples() {
            let day = b.floor(t).with_timezone(&Copenhagen).date_naive();
            let midnight = local(day.year(), day.month(), day.day(), 0, 0);
            let next = day.succ_opt().unwrap();
            let next_midnight = local(next.year(), next.month(), next.day(), 0, 0);
            assert!(midnight <= t && t < next_midnight, "{t} outside [{midnight}, {next_midnight})");
            // the noon key lies inside that day too
            assert!(midnight < b.floor(t) && b.floor(t) < next_midnight);
        }
        let morning = local(2024, 6, 15, 7, 0);
        assert!(b.floor(morning) > morning);
    }

    #[test]
    fn advancing_days_across_dst_keeps_noon() {
        let b = Bucketing::new(IntervalSpec::Days, Copenhagen);
        // entering DST
        assert_eq!(b.advance(local(2024, 3, 30, 12, 0)), local(2024, 3, 31, 12, 0));
        assert_eq!(b.advance(local(2024, 3, 31, 12, 0)), local(2024, 4, 1, 12, 0));
        // leaving DST
        assert_eq!(b.advance(local(2024, 10, 26, 12, 0)), local(2024, 10, 27, 12, 0));
        assert_eq!(b.advance(local(2024, 10, 27, 12, 0)), local(2024, 10, 28, 12, 0));
    }

    #[test]
    fn advancing_months_across_dst_keeps_noon_on_the_first() {
        let b = Bucketing::new(IntervalSpec::Months, Copenhagen);
        assert_eq!(b.floor(local(2024, 3, 17, 8, 0)), local(2024, 3, 1, 12, 0));
        assert_eq!(b.advance(local(2024, 3, 1, 12, 0)), local(2024, 4, 1, 12, 0));
        assert_eq!(b.advance(local(2024, 10, 1, 12, 0)), local(2024, 11, 1, 12, 0));
        assert_eq!(b.advance(local(2024, 12, 1, 12, 0)), local(2025, 1, 1, 12, 0));
    }

    #[test]
    fn years_advance_from_january_noon() {
        let key = Granularity::Year.floor(local(2024, 7, 4, 9, 0), &Copenhagen);
        assert_eq!(key, local(2024, 1, 1, 12, 0));
        assert_eq!(Granularity::Year.advance(key, &Copenhagen), local(2025, 1, 1, 12, 0));
    }

    #[test]
    fn month_addition_anchors_month_ends() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(add_months_to_date(d(2024, 1, 31), 1), d(2024, 2, 29));
        assert_eq!(add_months_to_date(d(2024, 2, 29), 1), d(2024, 3, 31));
        assert_eq!(add_months_to_date(d(2024, 4, 30), 1), d(2024, 5, 31));
        assert_eq!(add_months_to_date(d(2024, 1, 30), 1), d(2024, 2, 29));
        assert_eq!(add_months_to_date(d(2024, 1, 15), 1), d(2024, 2, 15));
        assert_eq!(add_months_to_date(d(2024, 12, 31), 1), d(2025, 1, 31));
        assert_eq!(add_months_to_date(d(2024, 2, 29), 12), d(2025, 2, 28));
    }

    #[test]
    fn timeline_covers_window() {
        let b = Bucketing::new(IntervalSpec::Days, Copenhagen);
        let keys = b.timeline(local(2024, 10, 26, 0, 0), local(2024, 10, 29, 0, 0));
        assert_eq!(
            keys,
            vec![local(2024, 10, 26, 12, 0), local(2024, 10, 27, 12, 0), local(2024, 10, 28, 12, 0)]
        );
    }

    #[test]
    fn detects_daylight_saving_time() {
        assert!(is_daylight_saving_time(local(2024, 7, 1, 12, 0), &Copenhagen));
        assert!(!is_daylight_saving_time(local(2024, 1, 1, 12, 0), &Copenhagen));
    }

    #[test]
    fn resolution_fractions() {
        let tz = &Copenhagen;
        assert!(!Granularity::Day.is_complete(local(2024, 5, 1, 14, 59), tz));
        assert!(!Granularity::Day.is_complete(local(2024, 5, 1, 15, 0), tz));
        assert!(Granularity::Day.is_complete(local(2024, 5, 1, 15, 1), tz));

        assert!(!Granularity::Month.is_complete(local(2024, 1, 30, 23, 0), tz));
        assert!(Granularity::Month.is_complete(local(2024, 1, 31, 12, 0), tz));
        assert!(Granularity::Month.is_complete(local(2024, 2, 29, 23, 58), tz));

        assert!(!Granularity::Year.is_complete(local(2024, 10, 1, 0, 0), tz));
        assert!(Granularity::Year.is_complete(local(2024, 11, 1, 0, 0), tz));
        assert!(is_greater_than_resolution_fraction(Granularity::Year, 0.5, local(2024, 7, 15, 0, 0), tz));
    }
}
