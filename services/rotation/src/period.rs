//! ISO-week period labels.
//!
//! Every assignment is tagged with the ISO week it was made in, rendered as
//! `YYYY-Www` (`2026-W42`). The label is derived from the wall clock at the
//! moment of selection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

/// Errors from parsing or building a period label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodError {
    #[error("period label must look like YYYY-Www, got '{0}'")]
    Malformed(String),

    #[error("{year} has no ISO week {week}")]
    NoSuchWeek { year: i32, week: u32 },
}

/// One ISO week, identified by the Monday it starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodLabel {
    monday: NaiveDate,
}

impl PeriodLabel {
    /// Builds the label for ISO `year` and `week`.
    pub fn new(year: i32, week: u32) -> Result<Self, PeriodError> {
        NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
            .map(|monday| Self { monday })
            .ok_or(PeriodError::NoSuchWeek { year, week })
    }

    /// The ISO week containing `at` (UTC).
    pub fn containing(at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        let offset = i64::from(date.weekday().num_days_from_monday());
        Self {
            monday: date - Duration::days(offset),
        }
    }

    /// ISO week-numbering year. Differs from the calendar year around New Year.
    pub fn year(&self) -> i32 {
        self.monday.iso_week().year()
    }

    /// ISO week number, 1 through 53.
    pub fn week(&self) -> u32 {
        self.monday.iso_week().week()
    }

    /// First day of the week.
    pub fn monday(&self) -> NaiveDate {
        self.monday
    }

    /// Last day of the week.
    pub fn sunday(&self) -> NaiveDate {
        self.monday + Duration::days(6)
    }

    /// The following week.
    pub fn next(&self) -> Self {
        Self {
            monday: self.monday + Duration::days(7),
        }
    }
}

impl fmt::Display for PeriodLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-W{:02}", self.year(), self.week())
    }
}

impl FromStr for PeriodLabel {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PeriodError::Malformed(s.to_string());
        let (year, week) = s.split_once("-W").ok_or_else(malformed)?;
        if year.len() != 4 || week.len() != 2 {
            return Err(malformed());
        }
        let year: i32 = year.parse().map_err(|_| malformed())?;
        let week: u32 = week.parse().map_err(|_| malformed())?;
        Self::new(year, week)
    }
}

impl serde::Serialize for PeriodLabel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PeriodLabel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
