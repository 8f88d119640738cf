//! Next-fire computation for scheduled jobs.
//!
//! A schedule is a start time, an interval unit and a frequency. With
//! `Every(n)` the job fires every n units from the start; with `Only(set)` it
//! steps one unit at a time and fires only when the candidate's sub-unit
//! (minute of hour, ISO weekday, month of year, ...) is in the set.
//!
//! MONTH is a fixed 31 days and YEAR a fixed 365 days. MONTH_START/MONTH_END
//! and YEAR_START/YEAR_END snap to calendar days and keep the start's time
//! of day.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use thiserror::Error;

use crate::domain::Job;

/// Upper bound on candidates examined per lookup
const MAX_CANDIDATES: usize = 100_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid {field} timestamp '{value}'")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("unknown interval '{0}'")]
    UnknownInterval(String),

    #[error("invalid frequency '{value}': {reason}")]
    InvalidFrequency { value: String, reason: String },

    #[error("end is before start")]
    EndBeforeStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    /// Fixed 31 days
    Month,
    MonthStart,
    MonthEnd,
    /// Fixed 365 days
    Year,
    YearStart,
    YearEnd,
}

impl IntervalUnit {
    /// Length in seconds for fixed-length units
    fn fixed_seconds(self) -> Option<i64> {
        match self {
            Self::Minute => Some(60),
            Self::Hour => Some(3_600),
            Self::Day => Some(86_400),
            Self::Week => Some(7 * 86_400),
            Self::Month => Some(31 * 86_400),
            Self::Year => Some(365 * 86_400),
            _ => None,
        }
    }

    /// Valid sub-unit values for `Only` frequencies
    fn sub_unit_range(self) -> Option<(i64, i64)> {
        match self {
            Self::Minute => Some((0, 59)),
            Self::Hour => Some((0, 23)),
            Self::Day => Some((1, 7)),
            Self::Week => Some((1, 5)),
            Self::Month | Self::MonthStart | Self::MonthEnd => Some((1, 12)),
            Self::Year | Self::YearStart | Self::YearEnd => None,
        }
    }

    /// Sub-unit of a candidate time
    fn sub_unit(self, at: &DateTime<Utc>) -> i64 {
        match self {
            Self::Minute => at.minute() as i64,
            Self::Hour => at.hour() as i64,
            Self::Day => at.weekday().number_from_monday() as i64,
            Self::Week => ((at.day() - 1) / 7 + 1) as i64,
            Self::Month | Self::MonthStart | Self::MonthEnd => at.month() as i64,
            Self::Year | Self::YearStart | Self::YearEnd => at.year() as i64,
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = ScheduleError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "month_start" => Ok(Self::MonthStart),
            "month_end" => Ok(Self::MonthEnd),
            "year" => Ok(Self::Year),
            "year_start" => Ok(Self::YearStart),
            "year_end" => Ok(Self::YearEnd),
            _ => Err(ScheduleError::UnknownInterval(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frequency {
    /// Fire every n units
    Every(u32),
    /// Fire only on these sub-units
    Only(BTreeSet<i64>),
}

impl Frequency {
    /// Parse a frequency for a unit.
    ///
    /// Empty means every unit; a single number is a multiple; a comma
    /// separated list (a trailing comma makes a one-item list) enumerates
    /// sub-units.
    pub fn parse(input: Option<&str>, unit: IntervalUnit) -> Result<Self, ScheduleError> {
        let raw = input.map(str::trim).unwrap_or("");
        if raw.is_empty() {
            return Ok(Self::Every(1));
        }

        let invalid = |reason: String| ScheduleError::InvalidFrequency {
            value: raw.to_string(),
            reason,
        };

        if !raw.contains(',') {
            let n: u32 = raw
                .parse()
                .map_err(|_| invalid("expected a positive integer".to_string()))?;
            if n == 0 {
                return Err(invalid("multiple must be at least 1".to_string()));
            }
            return Ok(Self::Every(n));
        }

        let mut set = BTreeSet::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let value: i64 = part
                .parse()
                .map_err(|_| invalid(format!("'{}' is not an integer", part)))?;
            if let Some((min, max)) = unit.sub_unit_range() {
                if value < min || value > max {
                    return Err(invalid(format!(
                        "{} is outside {}..={} for this interval",
                        value, min, max
                    )));
                }
            }
            set.insert(value);
        }
        if set.is_empty() {
            return Err(invalid("empty list".to_string()));
        }
        Ok(Self::Only(set))
    }

    fn multiple(&self) -> i64 {
        match self {
            Self::Every(n) => *n as i64,
            Self::Only(_) => 1,
        }
    }
}

/// Parse a job timestamp: RFC 3339, or a naive date/time taken as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub unit: IntervalUnit,
    pub frequency: Frequency,
    pub repeats: bool,
}

impl Schedule {
    pub fn from_job(job: &Job) -> Result<Self, ScheduleError> {
        let start = parse_timestamp(&job.start).ok_or_else(|| ScheduleError::InvalidTimestamp {
            field: "start",
            value: job.start.clone(),
        })?;
        let end = match job.end.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                Some(parse_timestamp(raw).ok_or_else(|| ScheduleError::InvalidTimestamp {
                    field: "end",
                    value: raw.to_string(),
                })?)
            }
            _ => None,
        };
        if end.map_or(false, |end| end < start) {
            return Err(ScheduleError::EndBeforeStart);
        }

        let unit: IntervalUnit = job.interval.parse()?;
        let frequency = Frequency::parse(job.frequency.as_deref(), unit)?;

        Ok(Self {
            start,
            end,
            unit,
            frequency,
            repeats: job.repeats,
        })
    }

    /// First time the job fires
    pub fn first_fire(&self) -> Option<DateTime<Utc>> {
        self.search(self.start)
    }

    /// Earliest fire time strictly after `after`
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.fire_at_or_after(after + Duration::nanoseconds(1))
    }

    /// Earliest fire time at or after `at`
    pub fn fire_at_or_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.repeats {
            return self.first_fire().filter(|first| *first >= at);
        }
        self.search(at.max(self.start))
    }

    /// True once no further fires can happen after `now`
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.next_fire(now).is_none()
    }

    fn search(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut k = self.estimate_k(from);

        for _ in 0..MAX_CANDIDATES {
            let candidate = self.candidate(k)?;
            if self.end.map_or(false, |end| candidate > end) {
                return None;
            }
            if candidate >= from && candidate >= self.start && self.matches(&candidate) {
                return Some(candidate);
            }
            if let (Frequency::Only(set), IntervalUnit::Year | IntervalUnit::YearStart | IntervalUnit::YearEnd) =
                (&self.frequency, self.unit)
            {
                if set.iter().next_back().map_or(true, |max| candidate.year() as i64 > *max) {
                    return None;
                }
            }
            k += 1;
        }
        None
    }

    fn matches(&self, candidate: &DateTime<Utc>) -> bool {
        match &self.frequency {
            Frequency::Every(_) => true,
            Frequency::Only(set) => set.contains(&self.unit.sub_unit(candidate)),
        }
    }

    /// The k-th candidate; increasing in k
    fn candidate(&self, k: i64) -> Option<DateTime<Utc>> {
        let step = self.frequency.multiple() * k;

        if let Some(seconds) = self.unit.fixed_seconds() {
            return self
                .start
                .checked_add_signed(Duration::seconds(seconds.checked_mul(step)?));
        }

        let time = self.start.time();
        let date = match self.unit {
            IntervalUnit::MonthStart | IntervalUnit::MonthEnd => {
                let index = month_index(&self.start) + step;
                let year = i32::try_from(index.div_euclid(12)).ok()?;
                let month = (index.rem_euclid(12) + 1) as u32;
                if self.unit == IntervalUnit::MonthStart {
                    NaiveDate::from_ymd_opt(year, month, 1)?
                } else {
                    last_day_of_month(year, month)?
                }
            }
            IntervalUnit::YearStart => {
                NaiveDate::from_ymd_opt(self.start.year() + i32::try_from(step).ok()?, 1, 1)?
            }
            IntervalUnit::YearEnd => {
                NaiveDate::from_ymd_opt(self.start.year() + i32::try_from(step).ok()?, 12, 31)?
            }
            _ => return None,
        };

        Some(Utc.from_utc_datetime(&date.and_time(time)))
    }

    /// A k whose candidate is not after `from`, or 0
    fn estimate_k(&self, from: DateTime<Utc>) -> i64 {
        if from <= self.start {
            return 0;
        }
        let multiple = self.frequency.multiple();

        if let Some(seconds) = self.unit.fixed_seconds() {
            return (from - self.start).num_seconds() / (seconds * multiple);
        }

        let units = match self.unit {
            IntervalUnit::MonthStart | IntervalUnit::MonthEnd => {
                month_index(&from) - month_index(&self.start)
            }
            _ => (from.year() - self.start.year()) as i64,
        };
        // One step back covers a start day later in the month than `from`
        (units / multiple - 1).max(0)
    }
}

fn month_index(at: &DateTime<Utc>) -> i64 {
    at.year() as i64 * 12 + at.month0() as i64
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}
