//! Time-window and session helpers shared by the feature extractors.
//!
//! Every helper expects events sorted by timestamp and already truncated to
//! the prediction date.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

use crate::events::{Event, EventType};

/// Consecutive events further apart than this start a new session.
pub const SESSION_GAP_SECONDS: i64 = 1_800;
pub const DEFAULT_PEAK_HOUR: u32 = 12;

/// Events in `[prediction_date - days, prediction_date]`.
pub fn last_days(events: &[Event], prediction_date: DateTime<Utc>, days: i64) -> &[Event] {
    let start = prediction_date - Duration::days(days);
    let from = events.partition_point(|e| e.timestamp < start);
    let to = events.partition_point(|e| e.timestamp <= prediction_date);
    &events[from..to.max(from)]
}

pub fn count_type(events: &[Event], event_type: &EventType) -> usize {
    events.iter().filter(|e| &e.event_type == event_type).count()
}

pub fn purchases(events: &[Event]) -> impl Iterator<Item = &Event> {
    events.iter().filter(|e| e.is_purchase())
}

pub fn active_days(events: &[Event]) -> BTreeSet<NaiveDate> {
    events.iter().map(|e| e.timestamp.date_naive()).collect()
}

pub fn unique_days(events: &[Event]) -> usize {
    active_days(events).len()
}

/// Whole days elapsed, floored.
pub fn days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_seconds().div_euclid(86_400)
}

pub fn days_since_last(events: &[Event], prediction_date: DateTime<Utc>) -> Option<i64> {
    events
        .last()
        .map(|e| days_between(e.timestamp, prediction_date))
}

pub fn days_since_last_purchase(events: &[Event], prediction_date: DateTime<Utc>) -> Option<i64> {
    purchases(events)
        .last()
        .map(|e| days_between(e.timestamp, prediction_date))
}

/// Splits events into idle-gap chains.
pub fn sessions(events: &[Event]) -> Vec<&[Event]> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..events.len() {
        let gap = (events[i].timestamp - events[i - 1].timestamp).num_seconds();
        if gap > SESSION_GAP_SECONDS {
            out.push(&events[start..i]);
            start = i;
        }
    }
    if start < events.len() {
        out.push(&events[start..]);
    }
    out
}

pub fn session_count(events: &[Event]) -> usize {
    if events.len() < 2 {
        return events.len();
    }
    sessions(events).len()
}

/// Mean duration in seconds over sessions holding at least two events.
pub fn avg_session_duration(events: &[Event]) -> f64 {
    if events.len() < 2 {
        return 0.0;
    }
    let durations: Vec<f64> = sessions(events)
        .into_iter()
        .filter(|s| s.len() > 1)
        .map(|s| (s[s.len() - 1].timestamp - s[0].timestamp).num_seconds() as f64)
        .collect();
    mean(&durations)
}

/// Most frequent event hour; ties go to the hour seen first.
pub fn peak_hour(events: &[Event]) -> u32 {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    let mut order = Vec::new();
    for event in events {
        let hour = event.timestamp.hour();
        let count = counts.entry(hour).or_insert(0);
        if *count == 0 {
            order.push(hour);
        }
        *count += 1;
    }

    let mut best: Option<(u32, usize)> = None;
    for hour in order {
        let count = counts[&hour];
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((hour, count));
        }
    }
    best.map(|(h, _)| h).unwrap_or(DEFAULT_PEAK_HOUR)
}

pub fn weekend_ratio(events: &[Event]) -> f64 {
    if events.is_empty() {
        return 0.0;
    }
    let weekend = events
        .iter()
        .filter(|e| e.timestamp.weekday().num_days_from_monday() >= 5)
        .count();
    weekend as f64 / events.len() as f64
}

/// `numerator / denominator`, or 0 for an empty denominator.
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Relative change `(short - long) / long`, or 0 for an empty baseline.
pub fn relative_change(short: f64, long: f64) -> f64 {
    if long == 0.0 {
        0.0
    } else {
        (short - long) / long
    }
}

/// `1 - (short/short_days) / (long/long_days)`, or 0 without long-window activity.
pub fn activity_drop(short_count: usize, short_days: i64, long_count: usize, long_days: i64) -> f64 {
    if long_count == 0 {
        return 0.0;
    }
    let short_rate = short_count as f64 / short_days as f64;
    let long_rate = long_count as f64 / long_days as f64;
    1.0 - short_rate / long_rate
}

/// Gaps in days between consecutive distinct active dates.
pub fn active_day_gaps(events: &[Event]) -> Vec<f64> {
    let days: Vec<NaiveDate> = active_days(events).into_iter().collect();
    days.windows(2)
        .map(|pair| (pair[1] - pair[0]).num_days() as f64)
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minutes: i64) -> DateTime<Utc> {
        // 2025-01-06 is a Monday.
        Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn events(offsets_min: &[i64]) -> Vec<Event> {
        offsets_min
            .iter()
            .map(|m| Event::new(1, EventType::View, at(*m)))
            .collect()
    }

    #[test]
    fn single_chain_is_one_session() {
        let evs = events(&[0, 20, 45, 70]);
        assert_eq!(session_count(&evs), 1);
        assert!((avg_session_duration(&evs) - 70.0 * 60.0).abs() < 1e-9);
    }

    #[test]
    fn gap_over_thirty_minutes_splits_session() {
        let evs = events(&[0, 10, 41, 50]);
        assert_eq!(session_count(&evs), 2);
        // sessions of 600s and 540s
        assert!((avg_session_duration(&evs) - 570.0).abs() < 1e-9);
    }

    #[test]
    fn gap_of_exactly_thirty_minutes_keeps_session() {
        let evs = events(&[0, 30]);
        assert_eq!(session_count(&evs), 1);
    }

    #[test]
    fn singleton_sessions_count_but_do_not_weigh_duration() {
        let evs = events(&[0, 100, 110]);
        assert_eq!(session_count(&evs), 2);
        assert!((avg_session_duration(&evs) - 600.0).abs() < 1e-9);
        assert_eq!(session_count(&events(&[5])), 1);
        assert_eq!(avg_session_duration(&events(&[5])), 0.0);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let pd = at(0);
        let evs = vec![
            Event::new(1, EventType::View, pd - Duration::days(7)),
            Event::new(1, EventType::View, pd - Duration::days(7) - Duration::seconds(1)),
            Event::new(1, EventType::View, pd),
        ];
        let mut sorted = evs;
        sorted.sort_by_key(|e| e.timestamp);
        assert_eq!(last_days(&sorted, pd, 7).len(), 2);
        assert_eq!(last_days(&sorted, pd, 8).len(), 3);
    }

    #[test]
    fn peak_hour_defaults_and_prefers_first_seen_on_ties() {
        assert_eq!(peak_hour(&[]), DEFAULT_PEAK_HOUR);
        let evs = events(&[0, 60, 61]);
        assert_eq!(peak_hour(&evs), 10);
        let tied = events(&[0, 60]);
        assert_eq!(peak_hour(&tied), 9);
    }

    #[test]
    fn weekend_ratio_counts_saturday_and_sunday() {
        let saturday = Utc.with_ymd_and_hms(2025, 1, 11, 10, 0, 0).unwrap();
        let evs = vec![
            Event::new(1, EventType::View, at(0)),
            Event::new(1, EventType::View, saturday),
            Event::new(1, EventType::View, saturday + Duration::days(1)),
            Event::new(1, EventType::View, saturday + Duration::days(2)),
        ];
        assert!((weekend_ratio(&evs) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn activity_drop_and_ratios_handle_empty_baselines() {
        assert_eq!(activity_drop(3, 7, 0, 14), 0.0);
        assert!((activity_drop(7, 7, 14, 14) - 0.0).abs() < 1e-12);
        assert!((activity_drop(0, 7, 14, 14) - 1.0).abs() < 1e-12);
        assert_eq!(ratio(5.0, 0.0), 0.0);
        assert_eq!(relative_change(2.0, 0.0), 0.0);
        assert!((relative_change(1.0, 2.0) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn day_gaps_use_distinct_dates() {
        let base = at(0);
        let evs = vec![
            Event::new(1, EventType::View, base),
            Event::new(1, EventType::View, base + Duration::hours(1)),
            Event::new(1, EventType::View, base + Duration::days(3)),
            Event::new(1, EventType::View, base + Duration::days(4)),
        ];
        assert_eq!(active_day_gaps(&evs), vec![3.0, 1.0]);
        assert_eq!(days_between(base, base + Duration::hours(47)), 1);
    }
}
