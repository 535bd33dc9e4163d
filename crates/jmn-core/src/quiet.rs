//! Working-hours window used to decide whether a notification should be silent.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuietHours {
    pub utc_offset_hours: i32,
    /// First working hour (inclusive).
    pub start_hour: u32,
    /// End of the working day (exclusive).
    pub end_hour: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        // Moscow working day.
        Self {
            utc_offset_hours: 3,
            start_hour: 9,
            end_hour: 18,
        }
    }
}

impl QuietHours {
    /// True outside Monday–Friday `start_hour..end_hour` in the configured offset.
    pub fn is_quiet_time(&self, now: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_hours * 3600) else {
            return false;
        };
        let local = now.with_timezone(&offset);
        let workday = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        let hour = local.hour();
        !(workday && hour >= self.start_hour && hour < self.end_hour)
    }

    /// Whether a notification should be delivered without sound.
    pub fn silent(&self, quiet_enabled: bool, now: DateTime<Utc>) -> bool {
        quiet_enabled && self.is_quiet_time(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekday_working_hours_are_not_quiet() {
        let q = QuietHours::default();
        // 2025-03-19 is a Wednesday. 06:00 UTC == 09:00 MSK.
        assert!(!q.is_quiet_time(utc(2025, 3, 19, 6, 0)));
        assert!(!q.is_quiet_time(utc(2025, 3, 19, 14, 59)));
    }

    #[test]
    fn boundaries_and_nights_are_quiet() {
        let q = QuietHours::default();
        // 05:59 UTC == 08:59 MSK.
        assert!(q.is_quiet_time(utc(2025, 3, 19, 5, 59)));
        // 15:00 UTC == 18:00 MSK (end is exclusive).
        assert!(q.is_quiet_time(utc(2025, 3, 19, 15, 0)));
        // 22:30 UTC Tuesday is already Wednesday 01:30 MSK.
        assert!(q.is_quiet_time(utc(2025, 3, 18, 22, 30)));
    }

    #[test]
    fn weekends_are_quiet_all_day() {
        let q = QuietHours::default();
        // Saturday noon MSK.
        assert!(q.is_quiet_time(utc(2025, 3, 22, 9, 0)));
        // Friday 22:00 UTC is Saturday 01:00 MSK.
        assert!(q.is_quiet_time(utc(2025, 3, 21, 22, 0)));
    }

    #[test]
    fn silent_requires_opt_in() {
        let q = QuietHours::default();
        let night = utc(2025, 3, 19, 20, 0);
        assert!(q.silent(true, night));
        assert!(!q.silent(false, night));
        assert!(!q.silent(true, utc(2025, 3, 19, 8, 0)));
    }
}
