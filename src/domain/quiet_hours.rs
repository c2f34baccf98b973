//! Quiet Hours - Windows Excluded from Stall Detection
//!
//! Windows are evaluated in UTC. A weekly window is written as
//! `"Fri 21:00"` → `"Sun 21:00"` and may wrap the end of the week; a
//! daily window is written as `"22:00"` → `"23:30"` and may wrap
//! midnight. Start is inclusive, end exclusive.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};

const MINUTES_PER_DAY: u32 = 24 * 60;
const MINUTES_PER_WEEK: u32 = 7 * MINUTES_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    /// Minutes since Monday 00:00.
    Weekly { start: u32, end: u32 },
    /// Minutes since midnight.
    Daily { start: u32, end: u32 },
}

impl Window {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        let minute_of_day = at.hour() * 60 + at.minute();
        match *self {
            Self::Weekly { start, end } => {
                let minute = at.weekday().num_days_from_monday() * MINUTES_PER_DAY + minute_of_day;
                within(minute, start, end)
            }
            Self::Daily { start, end } => within(minute_of_day, start, end),
        }
    }
}

fn within(minute: u32, start: u32, end: u32) -> bool {
    if start <= end {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end
    }
}

/// A set of quiet windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuietHours {
    windows: Vec<Window>,
}

impl QuietHours {
    /// No quiet windows: every instant is active.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse `(start, end)` pairs.
    ///
    /// # Errors
    /// Returns a description of the first malformed bound, or of a pair
    /// that mixes weekly and daily forms.
    pub fn parse<'a, I>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut windows = Vec::new();
        for (start, end) in pairs {
            let window = match (parse_bound(start)?, parse_bound(end)?) {
                (Bound::Weekly(s), Bound::Weekly(e)) => Window::Weekly { start: s, end: e },
                (Bound::Daily(s), Bound::Daily(e)) => Window::Daily { start: s, end: e },
                _ => {
                    return Err(format!(
                        "quiet window {start:?} → {end:?} mixes weekly and daily bounds"
                    ));
                }
            };
            windows.push(window);
        }
        Ok(Self { windows })
    }

    /// Whether `at` falls inside any window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.windows.iter().any(|w| w.contains(at))
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

enum Bound {
    Weekly(u32),
    Daily(u32),
}

fn parse_bound(raw: &str) -> Result<Bound, String> {
    let raw = raw.trim();
    let (day, time) = match raw.split_once(char::is_whitespace) {
        Some((day, time)) => (Some(day), time.trim()),
        None => (None, raw),
    };

    let time = NaiveTime::parse_from_str(time, "%H:%M")
        .map_err(|e| format!("invalid time in quiet window bound {raw:?}: {e}"))?;
    let minute = time.hour() * 60 + time.minute();

    match day {
        Some(day) => {
            let weekday = Weekday::from_str(day)
                .map_err(|_| format!("invalid weekday in quiet window bound {raw:?}"))?;
            let minute = weekday.num_days_from_monday() * MINUTES_PER_DAY + minute;
            debug_assert!(minute < MINUTES_PER_WEEK);
            Ok(Bound::Weekly(minute))
        }
        None => Ok(Bound::Daily(minute)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekly_window_wraps_weekend() {
        // FX market close: Friday 21:00 UTC to Sunday 21:00 UTC.
        let quiet = QuietHours::parse([("Fri 21:00", "Sun 21:00")]).unwrap();
        // 2024-03-01 is a Friday.
        assert!(!quiet.contains(at(2024, 3, 1, 20, 59)));
        assert!(quiet.contains(at(2024, 3, 1, 21, 0)));
        assert!(quiet.contains(at(2024, 3, 2, 12, 0)));
        assert!(quiet.contains(at(2024, 3, 3, 20, 59)));
        assert!(!quiet.contains(at(2024, 3, 3, 21, 0)));
        assert!(!quiet.contains(at(2024, 3, 4, 9, 0)));
    }

    #[test]
    fn weekly_window_across_week_boundary() {
        let quiet = QuietHours::parse([("Sun 22:00", "Mon 01:00")]).unwrap();
        assert!(quiet.contains(at(2024, 3, 3, 23, 0)));
        assert!(quiet.contains(at(2024, 3, 4, 0, 30)));
        assert!(!quiet.contains(at(2024, 3, 4, 1, 0)));
    }

    #[test]
    fn daily_window_wraps_midnight() {
        let quiet = QuietHours::parse([("23:30", "00:15")]).unwrap();
        assert!(quiet.contains(at(2024, 3, 5, 23, 45)));
        assert!(quiet.contains(at(2024, 3, 6, 0, 10)));
        assert!(!quiet.contains(at(2024, 3, 6, 0, 15)));
        assert!(!quiet.contains(at(2024, 3, 6, 12, 0)));
    }

    #[test]
    fn rejects_malformed_bounds() {
        assert!(QuietHours::parse([("Fri 25:00", "Sun 21:00")]).is_err());
        assert!(QuietHours::parse([("Funday 21:00", "Sun 21:00")]).is_err());
        assert!(QuietHours::parse([("Fri 21:00", "21:00")]).is_err());
    }

    #[test]
    fn empty_set_is_never_quiet() {
        assert!(!QuietHours::none().contains(Utc::now()));
    }
}
