//! Weekly polling calendar.
//!
//! Slots are wall-clock times in a fixed UTC offset. The default cadence is a
//! steady two-hourly baseline with denser bursts around line openers, injury
//! reports and pre-game windows; it spends roughly the 500-call monthly quota.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, TimeZone, Timelike, Utc, Weekday};
use std::collections::BTreeSet;

const MINUTES_PER_DAY: u32 = 24 * 60;
const MINUTES_PER_WEEK: u32 = 7 * MINUTES_PER_DAY;

/// Whole-hour UTC offset. Out-of-range values fall back to UTC.
pub fn utc_offset(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or(Utc.fix())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySchedule {
    offset: FixedOffset,
    /// Minutes since Monday 00:00 local.
    slots: BTreeSet<u32>,
}

impl WeeklySchedule {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            slots: BTreeSet::new(),
        }
    }

    /// Adds a slot. Duplicates collapse; invalid times are ignored.
    pub fn at(mut self, day: Weekday, hour: u32, minute: u32) -> Self {
        if hour < 24 && minute < 60 {
            self.slots
                .insert(day.num_days_from_monday() * MINUTES_PER_DAY + hour * 60 + minute);
        }
        self
    }

    fn every(self, day: Weekday, hours: impl IntoIterator<Item = u32>, minutes: &[u32]) -> Self {
        hours.into_iter().fold(self, |schedule, hour| {
            minutes.iter().fold(schedule, |s, &minute| s.at(day, hour, minute))
        })
    }

    /// Steady baseline plus peak bursts.
    pub fn steady_flow(offset: FixedOffset) -> Self {
        use Weekday::*;

        let mut schedule = Self::new(offset);

        // Baseline, every two hours
        for day in [Mon, Tue, Wed, Thu, Fri] {
            schedule = schedule.every(day, (8..22).step_by(2), &[0]);
        }
        schedule = schedule
            .every(Sat, (10..20).step_by(2), &[0])
            .every(Sun, (8..20).step_by(2), &[0]);

        // Openers: Sunday night into Monday morning
        schedule
            .every(Sun, [22, 23], &[0, 30])
            .every(Mon, 0..4, &[0, 30])
            // Injury reports
            .every(Wed, 13..21, &[0, 30])
            .every(Thu, 13..21, &[0, 30])
            // Final status
            .every(Fri, 13..19, &[0, 30])
            .every(Sat, 13..19, &[0, 30])
            // Sunday morning and pre-game
            .every(Sun, 6..12, &[0, 30])
            .every(Sun, [12, 13], &[0, 15, 30, 45])
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn calls_per_week(&self) -> usize {
        self.slots.len()
    }

    pub fn projected_monthly_calls(&self) -> usize {
        self.calls_per_week() * 52 / 12
    }

    /// First slot strictly after `now`, or `None` for an empty schedule.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let first = *self.slots.iter().next()?;

        let local = now.with_timezone(&self.offset);
        let week_start = local.date_naive()
            - Duration::days(i64::from(local.weekday().num_days_from_monday()));
        let week_start = self
            .offset
            .from_local_datetime(&week_start.and_hms_opt(0, 0, 0)?)
            .single()?;

        let elapsed = local.weekday().num_days_from_monday() * MINUTES_PER_DAY
            + local.hour() * 60
            + local.minute();

        // A slot in the current minute is not after `now`.
        let (base, minute) = match self.slots.range(elapsed + 1..).next() {
            Some(&m) => (week_start, m),
            None => (week_start + Duration::minutes(i64::from(MINUTES_PER_WEEK)), first),
        };

        Some((base + Duration::minutes(i64::from(minute))).with_timezone(&Utc))
    }
}
