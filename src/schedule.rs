//! Wall-clock schedules evaluated in a configured timezone.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest forward shift tried when a local time falls into a DST gap.
const DST_GAP_SEARCH_MINUTES: i64 = 180;
const DST_GAP_STEP_MINUTES: i64 = 15;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time `{0}`, expected HH:MM")]
    InvalidTime(String),
    #[error("invalid day of week `{0}`")]
    InvalidWeekday(String),
    #[error("day of month must be in 1..=31, got {0}")]
    InvalidDayOfMonth(u32),
    #[error("interval must be at least one minute")]
    InvalidInterval,
    #[error("unknown schedule kind `{0}`")]
    UnknownKind(String),
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "custom" => Ok(Self::Custom),
            other => Err(ScheduleError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    /// `day` past the end of a month runs on that month's last day.
    Monthly { day: u32, at: NaiveTime },
    Every { minutes: u32 },
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { at } => write!(f, "daily at {}", at.format("%H:%M")),
            Self::Weekly { weekday, at } => {
                write!(f, "every {weekday} at {}", at.format("%H:%M"))
            }
            Self::Monthly { day, at } => {
                write!(f, "monthly on day {day} at {}", at.format("%H:%M"))
            }
            Self::Every { minutes } => write!(f, "every {minutes} minutes"),
        }
    }
}

impl Schedule {
    pub fn from_parts(
        kind: ScheduleKind,
        time: &str,
        day_of_week: &str,
        day_of_month: u32,
        interval_minutes: u32,
    ) -> Result<Self, ScheduleError> {
        Ok(match kind {
            ScheduleKind::Hourly => Self::Every { minutes: 60 },
            ScheduleKind::Daily => Self::Daily {
                at: parse_time(time)?,
            },
            ScheduleKind::Weekly => Self::Weekly {
                weekday: parse_weekday(day_of_week)?,
                at: parse_time(time)?,
            },
            ScheduleKind::Monthly => {
                if !(1..=31).contains(&day_of_month) {
                    return Err(ScheduleError::InvalidDayOfMonth(day_of_month));
                }
                Self::Monthly {
                    day: day_of_month,
                    at: parse_time(time)?,
                }
            }
            ScheduleKind::Custom => {
                if interval_minutes == 0 {
                    return Err(ScheduleError::InvalidInterval);
                }
                Self::Every {
                    minutes: interval_minutes,
                }
            }
        })
    }

    /// First run strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&tz).date_naive();
        match *self {
            Self::Every { minutes } => Some(now + Duration::minutes(i64::from(minutes))),
            Self::Daily { at } => (0..=2)
                .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
                .filter_map(|date| resolve_local(tz, date.and_time(at)))
                .find(|run| *run > now),
            Self::Weekly { weekday, at } => (0..=14)
                .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
                .filter(|date| date.weekday() == weekday)
                .filter_map(|date| resolve_local(tz, date.and_time(at)))
                .find(|run| *run > now),
            Self::Monthly { day, at } => (0..=2)
                .filter_map(|offset| month_day(today, offset, day))
                .filter_map(|date| resolve_local(tz, date.and_time(at)))
                .find(|run| *run > now),
        }
    }
}

/// `day` in the month `offset` months after `from`, clamped to month length.
fn month_day(from: NaiveDate, offset: u32, day: u32) -> Option<NaiveDate> {
    let index = from.year() * 12 + from.month0() as i32 + offset as i32;
    let (year, month) = (index.div_euclid(12), index.rem_euclid(12) as u32 + 1);
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = first_next.pred_opt()?.day();
    NaiveDate::from_ymd_opt(year, month, day.min(last))
}

/// Maps a local wall-clock time to UTC. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward to the first valid one.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut shifted = 0;
    while shifted <= DST_GAP_SEARCH_MINUTES {
        let candidate = local + Duration::minutes(shifted);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => shifted += DST_GAP_STEP_MINUTES,
        }
    }
    None
}

pub fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}

/// Accepts English day names or `1..=7` with 1 as Monday.
pub fn parse_weekday(raw: &str) -> Result<Weekday, ScheduleError> {
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<u8>() {
        return match n {
            1..=7 => Ok(WEEK[usize::from(n - 1)]),
            _ => Err(ScheduleError::InvalidWeekday(raw.to_string())),
        };
    }
    trimmed
        .parse::<Weekday>()
        .map_err(|_| ScheduleError::InvalidWeekday(raw.to_string()))
}

pub fn parse_timezone(raw: &str) -> Result<Tz, ScheduleError> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn at(raw: &str) -> NaiveTime {
        parse_time(raw).expect("valid time")
    }

    #[test]
    fn daily_runs_today_or_tomorrow() {
        let daily = Schedule::Daily { at: at("02:00") };
        assert_eq!(
            daily.next_run_after(utc(2025, 5, 1, 1, 0), Tz::UTC),
            Some(utc(2025, 5, 1, 2, 0))
        );
        assert_eq!(
            daily.next_run_after(utc(2025, 5, 1, 2, 0), Tz::UTC),
            Some(utc(2025, 5, 2, 2, 0))
        );
    }

    #[test]
    fn daily_respects_timezone_offset() {
        let daily = Schedule::Daily { at: at("02:00") };
        let tz = parse_timezone("Europe/Moscow").expect("known zone");
        // 02:00 MSK is 23:00 UTC the previous day
        assert_eq!(
            daily.next_run_after(utc(2025, 5, 1, 12, 0), tz),
            Some(utc(2025, 5, 1, 23, 0))
        );
    }

    #[test]
    fn weekly_rolls_to_next_matching_weekday() {
        let weekly = Schedule::from_parts(ScheduleKind::Weekly, "03:00", "sunday", 1, 0)
            .expect("valid weekly schedule");
        // 2025-05-01 is a Thursday
        assert_eq!(
            weekly.next_run_after(utc(2025, 5, 1, 0, 0), Tz::UTC),
            Some(utc(2025, 5, 4, 3, 0))
        );
        assert_eq!(
            weekly.next_run_after(utc(2025, 5, 4, 3, 0), Tz::UTC),
            Some(utc(2025, 5, 11, 3, 0))
        );
    }

    #[test]
    fn monthly_clamps_to_month_length() {
        let monthly = Schedule::Monthly {
            day: 31,
            at: at("04:00"),
        };
        assert_eq!(
            monthly.next_run_after(utc(2025, 2, 10, 0, 0), Tz::UTC),
            Some(utc(2025, 2, 28, 4, 0))
        );
        assert_eq!(
            monthly.next_run_after(utc(2025, 12, 31, 5, 0), Tz::UTC),
            Some(utc(2026, 1, 31, 4, 0))
        );
    }

    #[test]
    fn dst_gap_moves_to_first_valid_instant() {
        let tz = parse_timezone("Europe/Berlin").expect("known zone");
        let daily = Schedule::Daily { at: at("02:30") };
        // 2025-03-30 02:00..03:00 does not exist in Berlin; 03:00 CEST is 01:00 UTC
        assert_eq!(
            daily.next_run_after(utc(2025, 3, 29, 12, 0), tz),
            Some(utc(2025, 3, 30, 1, 0))
        );
    }

    #[test]
    fn parts_are_validated() {
        assert_eq!(
            Schedule::from_parts(ScheduleKind::Daily, "25:00", "monday", 1, 0),
            Err(ScheduleError::InvalidTime("25:00".to_string()))
        );
        assert_eq!(
            Schedule::from_parts(ScheduleKind::Monthly, "01:00", "monday", 0, 0),
            Err(ScheduleError::InvalidDayOfMonth(0))
        );
        assert_eq!(
            Schedule::from_parts(ScheduleKind::Custom, "01:00", "monday", 1, 0),
            Err(ScheduleError::InvalidInterval)
        );
        assert_eq!(
            Schedule::from_parts(ScheduleKind::Hourly, "", "", 1, 0),
            Ok(Schedule::Every { minutes: 60 })
        );
        assert!("fortnightly".parse::<ScheduleKind>().is_err());
    }
}
