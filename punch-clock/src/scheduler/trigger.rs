//! Daily time-of-day triggers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Days searched ahead before giving up on a fire time.
const MAX_SEARCH_DAYS: u32 = 14;

/// A wall-clock time with minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::config(format!(
                "invalid time of day {hour:02}:{minute:02}"
            )));
        }
        Ok(Self {
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    pub fn hour(&self) -> u32 {
        self.hour as u32
    }

    pub fn minute(&self) -> u32 {
        self.minute as u32
    }

    fn to_naive_time(self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0)
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    /// Parse `HH:MM` (a single-digit hour is accepted).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config(format!("invalid time '{s}', expected HH:MM"));

        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if hour.is_empty()
            || hour.len() > 2
            || minute.len() != 2
            || !digits(hour)
            || !digits(minute)
        {
            return Err(invalid());
        }
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// When a job fires: a daily time, optionally restricted to weekdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trigger {
    pub time: TimeOfDay,
    pub weekdays_only: bool,
}

impl Trigger {
    pub fn daily(time: TimeOfDay) -> Self {
        Self {
            time,
            weekdays_only: false,
        }
    }

    pub fn weekdays(time: TimeOfDay) -> Self {
        Self {
            time,
            weekdays_only: true,
        }
    }

    /// Whether the trigger is active on `date`.
    pub fn fires_on(&self, date: NaiveDate) -> bool {
        !self.weekdays_only || !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// First fire time strictly after `now`, in `now`'s timezone.
    ///
    /// Days where the local time does not exist (DST gap) are skipped.
    pub fn next_fire_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let time = self.time.to_naive_time()?;
        let mut date = now.date_naive();

        for _ in 0..MAX_SEARCH_DAYS {
            if self.fires_on(date)
                && let Some(candidate) = tz.from_local_datetime(&date.and_time(time)).earliest()
                && candidate > *now
            {
                return Some(candidate);
            }
            date = date.succ_opt()?;
        }
        None
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weekdays_only {
            write!(f, "{} (weekdays)", self.time)
        } else {
            write!(f, "{} (daily)", self.time)
        }
    }
}
