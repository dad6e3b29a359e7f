//! Quiet-hours clock.
//!
//! Deterministic given a recipient timezone and the configured window.
//! Outbound SMS must not be dispatched while the recipient's local wall
//! clock is inside the window; a deferred send is scheduled for the next
//! window end.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Error parsing a quiet-hours boundary from configuration.
#[derive(Debug, Error)]
pub enum QuietHoursParseError {
    #[error("invalid quiet-hours time {value:?}: expected HH:MM")]
    InvalidTime { value: String },
}

/// A daily `[start, end)` local-time window during which outbound messages
/// are held.
///
/// When `start > end` the window wraps midnight (the default 21:00–08:00
/// does). Equal bounds mean no quiet window at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    /// Local wall-clock time the window opens.
    pub start: NaiveTime,
    /// Local wall-clock time the window closes (exclusive).
    pub end: NaiveTime,
}

impl QuietHours {
    /// Parse a window from `"HH:MM"` boundary strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, QuietHoursParseError> {
        let parse_one = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                QuietHoursParseError::InvalidTime {
                    value: value.to_owned(),
                }
            })
        };
        Ok(Self {
            start: parse_one(start)?,
            end: parse_one(end)?,
        })
    }

    /// Whether a local wall-clock time falls inside the window.
    #[must_use]
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start > self.end {
            // Wraps midnight: quiet from start until midnight, and from
            // midnight until end.
            local >= self.start || local < self.end
        } else {
            self.start <= local && local < self.end
        }
    }

    /// Whether `now` falls inside the window in the recipient's timezone.
    #[must_use]
    pub fn is_in_window(&self, tz: Tz, now: DateTime<Utc>) -> bool {
        self.contains(now.with_timezone(&tz).time())
    }

    /// The soonest instant strictly after `now` at which the recipient's
    /// local wall clock reaches the window end — i.e. the earliest time a
    /// deferred message will pass the quiet-hours check.
    ///
    /// DST-safe: when the end time is ambiguous (fall-back) the earliest
    /// mapping is used; when it does not exist (spring-forward gap) the same
    /// wall clock one hour later is used.
    #[must_use]
    pub fn window_end_after(&self, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&tz);
        for day_offset in 0..3 {
            let date = local_now.date_naive() + Duration::days(day_offset);
            let naive = date.and_time(self.end);
            let resolved = tz.from_local_datetime(&naive).earliest().or_else(|| {
                tz.from_local_datetime(&(naive + Duration::hours(1))).earliest()
            });
            if let Some(local_end) = resolved {
                let instant = local_end.with_timezone(&Utc);
                if instant > now {
                    return instant;
                }
            }
        }
        // Only reachable with a pathological zone; hold for a full day.
        now + Duration::hours(24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    fn window(start: &str, end: &str) -> QuietHours {
        QuietHours::parse(start, end).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(QuietHours::parse("21:00", "8am").is_err());
        assert!(QuietHours::parse("25:00", "08:00").is_err());
        assert!(QuietHours::parse("21:00", "08:00").is_ok());
    }

    #[test]
    fn wrapping_window_membership() {
        let w = window("21:00", "08:00");
        assert!(w.contains(NaiveTime::from_hms_opt(22, 0, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(3, 30, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(21, 0, 0).unwrap()));
        // The end boundary is exclusive — 08:00 exactly is allowed.
        assert!(!w.contains(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn non_wrapping_window_membership() {
        let w = window("01:00", "06:00");
        assert!(w.contains(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(5, 59, 59).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(6, 0, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(22, 0, 0).unwrap()));
    }

    #[test]
    fn equal_bounds_mean_no_window() {
        let w = window("09:00", "09:00");
        assert!(!w.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn in_window_at_10pm_pacific() {
        let w = window("21:00", "08:00");
        // 2025-06-15 05:00 UTC == 2025-06-14 22:00 PDT.
        let now = utc("2025-06-15T05:00:00Z");
        assert!(w.is_in_window(Los_Angeles, now));
        // Noon PDT is fine.
        assert!(!w.is_in_window(Los_Angeles, utc("2025-06-15T19:00:00Z")));
    }

    #[test]
    fn window_end_is_next_8am_local() {
        let w = window("21:00", "08:00");
        // 22:00 PDT on June 14 -> next end is 08:00 PDT June 15 == 15:00 UTC.
        let now = utc("2025-06-15T05:00:00Z");
        let end = w.window_end_after(Los_Angeles, now);
        assert_eq!(end, utc("2025-06-15T15:00:00Z"));
        // The returned instant passes the check.
        assert!(!w.is_in_window(Los_Angeles, end));
    }

    #[test]
    fn window_end_same_morning_before_8am() {
        let w = window("21:00", "08:00");
        // 07:00 PDT June 15 == 14:00 UTC -> end is 08:00 PDT the same day.
        let now = utc("2025-06-15T14:00:00Z");
        assert!(w.is_in_window(Los_Angeles, now));
        assert_eq!(w.window_end_after(Los_Angeles, now), utc("2025-06-15T15:00:00Z"));
    }

    #[test]
    fn window_end_is_strictly_future_at_boundary() {
        let w = window("21:00", "08:00");
        // Exactly 08:00 PDT: out of the window, and the next end is tomorrow.
        let now = utc("2025-06-15T15:00:00Z");
        assert!(!w.is_in_window(Los_Angeles, now));
        assert_eq!(w.window_end_after(Los_Angeles, now), utc("2025-06-16T15:00:00Z"));
    }

    #[test]
    fn spring_forward_gap_resolves_one_hour_later() {
        // 2025-03-09 02:00-03:00 does not exist in Los Angeles. An end of
        // 02:30 resolves to 03:30 PDT == 10:30 UTC.
        let w = window("22:00", "02:30");
        let now = utc("2025-03-09T09:00:00Z"); // 01:00 PST
        assert!(w.is_in_window(Los_Angeles, now));
        let end = w.window_end_after(Los_Angeles, now);
        assert_eq!(end, utc("2025-03-09T10:30:00Z"));
    }

    #[test]
    fn fall_back_ambiguity_takes_earliest() {
        // 2025-11-02 01:30 occurs twice in Los Angeles; the earliest (PDT)
        // mapping is 08:30 UTC.
        let w = window("23:00", "01:30");
        let now = utc("2025-11-02T07:00:00Z"); // 00:00 PDT
        assert!(w.is_in_window(Los_Angeles, now));
        let end = w.window_end_after(Los_Angeles, now);
        assert_eq!(end, utc("2025-11-02T08:30:00Z"));
    }

    #[test]
    fn utc_zone_has_no_dst_wrinkles() {
        let w = window("21:00", "08:00");
        let now = utc("2025-01-01T23:00:00Z");
        assert!(w.is_in_window(chrono_tz::UTC, now));
        assert_eq!(
            w.window_end_after(chrono_tz::UTC, now),
            utc("2025-01-02T08:00:00Z")
        );
    }
}
