//! Temporal validity evaluation
//!
//! A ruleset may carry a calendar-style recurrence specification in its
//! metadata. This module computes, from that specification and a reference
//! instant, the currently active or next future window in which the ruleset
//! is eligible to fire. Pure functions only; the deployment caches the
//! result between refresh cycles.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// Recurrence frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Repeat rule of a calendar event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,

    /// Every n-th occurrence (1 = every occurrence)
    #[serde(default = "default_interval")]
    pub interval: u32,

    /// Total number of occurrences, first one included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    /// Last instant (epoch millis) an occurrence may start at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
}

fn default_interval() -> u32 {
    1
}

/// Calendar event - a one-shot or recurring activation window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Window start, epoch millis
    pub starts: i64,

    /// Window end, epoch millis (must be after `starts`)
    pub ends: i64,

    /// Optional repeat rule; absent means one-shot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<RecurrenceRule>,
}

impl CalendarEvent {
    /// Compute the currently active or next future window
    ///
    /// Returns the window whose end lies after `now_millis`: the active one
    /// if `now_millis` falls inside it, otherwise the next future one.
    /// `None` means no occurrence ends after `now_millis` - the event has
    /// permanently expired.
    pub fn next_or_active_window(&self, now_millis: i64) -> Option<(i64, i64)> {
        let duration = self.ends - self.starts;
        if duration <= 0 {
            return None;
        }

        let Some(rule) = &self.recurrence else {
            // One-shot window
            return (self.ends > now_millis).then_some((self.starts, self.ends));
        };

        let interval = rule.interval.max(1);
        let start = DateTime::<Utc>::from_timestamp_millis(self.starts)?;

        let mut occurrence = 0u32;
        loop {
            if let Some(count) = rule.count {
                if occurrence >= count {
                    return None;
                }
            }

            let occ_start = advance(start, rule.frequency, occurrence * interval)?;
            let occ_start_millis = occ_start.timestamp_millis();

            if let Some(until) = rule.until {
                if occ_start_millis > until {
                    return None;
                }
            }

            let occ_end_millis = occ_start_millis + duration;
            if occ_end_millis > now_millis {
                return Some((occ_start_millis, occ_end_millis));
            }

            occurrence += 1;
        }
    }
}

/// Advance a start instant by `steps` recurrence units
fn advance(start: DateTime<Utc>, frequency: Frequency, steps: u32) -> Option<DateTime<Utc>> {
    match frequency {
        Frequency::Daily => start.checked_add_signed(Duration::days(i64::from(steps))),
        Frequency::Weekly => start.checked_add_signed(Duration::weeks(i64::from(steps))),
        Frequency::Monthly => start.checked_add_months(Months::new(steps)),
        Frequency::Yearly => start.checked_add_months(Months::new(steps * 12)),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    fn one_shot(starts: i64, ends: i64) -> CalendarEvent {
        CalendarEvent {
            starts,
            ends,
            recurrence: None,
        }
    }

    #[test]
    fn test_one_shot_future_window() {
        let event = one_shot(10 * HOUR, 12 * HOUR);
        assert_eq!(event.next_or_active_window(0), Some((10 * HOUR, 12 * HOUR)));
    }

    #[test]
    fn test_one_shot_active_window() {
        let event = one_shot(10 * HOUR, 12 * HOUR);
        assert_eq!(
            event.next_or_active_window(11 * HOUR),
            Some((10 * HOUR, 12 * HOUR))
        );
    }

    #[test]
    fn test_one_shot_expired() {
        let event = one_shot(10 * HOUR, 12 * HOUR);
        assert_eq!(event.next_or_active_window(12 * HOUR), None);
    }

    #[test]
    fn test_inverted_window_is_expired() {
        let event = one_shot(12 * HOUR, 10 * HOUR);
        assert_eq!(event.next_or_active_window(0), None);
    }

    #[test]
    fn test_daily_recurrence_advances_to_next_day() {
        let event = CalendarEvent {
            starts: 8 * HOUR,
            ends: 10 * HOUR,
            recurrence: Some(RecurrenceRule {
                frequency: Frequency::Daily,
                interval: 1,
                count: None,
                until: None,
            }),
        };

        // Past today's window: next occurrence is tomorrow
        let window = event.next_or_active_window(11 * HOUR).unwrap();
        assert_eq!(window, (DAY + 8 * HOUR, DAY + 10 * HOUR));

        // Inside day 3's window: that occurrence is returned
        let window = event.next_or_active_window(3 * DAY + 9 * HOUR).unwrap();
        assert_eq!(window, (3 * DAY + 8 * HOUR, 3 * DAY + 10 * HOUR));
    }

    #[test]
    fn test_recurrence_interval_skips_days() {
        let event = CalendarEvent {
            starts: 0,
            ends: HOUR,
            recurrence: Some(RecurrenceRule {
                frequency: Frequency::Daily,
                interval: 3,
                count: None,
                until: None,
            }),
        };

        let window = event.next_or_active_window(HOUR).unwrap();
        assert_eq!(window, (3 * DAY, 3 * DAY + HOUR));
    }

    #[test]
    fn test_recurrence_count_exhausted() {
        let event = CalendarEvent {
            starts: 0,
            ends: HOUR,
            recurrence: Some(RecurrenceRule {
                frequency: Frequency::Daily,
                interval: 1,
                count: Some(2),
                until: None,
            }),
        };

        // Occurrences on day 0 and day 1 only
        assert_eq!(
            event.next_or_active_window(DAY + 30 * 60_000),
            Some((DAY, DAY + HOUR))
        );
        assert_eq!(event.next_or_active_window(DAY + HOUR), None);
    }

    #[test]
    fn test_recurrence_until_bound() {
        let event = CalendarEvent {
            starts: 0,
            ends: HOUR,
            recurrence: Some(RecurrenceRule {
                frequency: Frequency::Daily,
                interval: 1,
                count: None,
                until: Some(2 * DAY),
            }),
        };

        // Day 2 starts exactly at the until bound and still counts
        assert_eq!(
            event.next_or_active_window(DAY + HOUR),
            Some((2 * DAY, 2 * DAY + HOUR))
        );
        assert_eq!(event.next_or_active_window(2 * DAY + HOUR), None);
    }

    #[test]
    fn test_weekly_recurrence() {
        let event = CalendarEvent {
            starts: 0,
            ends: 2 * HOUR,
            recurrence: Some(RecurrenceRule {
                frequency: Frequency::Weekly,
                interval: 1,
                count: None,
                until: None,
            }),
        };

        let window = event.next_or_active_window(3 * DAY).unwrap();
        assert_eq!(window, (7 * DAY, 7 * DAY + 2 * HOUR));
    }

    #[test]
    fn test_deserialize_from_meta_value() {
        let event: CalendarEvent = serde_json::from_value(json!({
            "starts": 1000,
            "ends": 2000,
            "recurrence": { "frequency": "daily", "count": 5 }
        }))
        .unwrap();

        let rule = event.recurrence.unwrap();
        assert_eq!(rule.frequency, Frequency::Daily);
        assert_eq!(rule.interval, 1);
        assert_eq!(rule.count, Some(5));
        assert_eq!(rule.until, None);
    }
}
