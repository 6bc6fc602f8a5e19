use chrono::{Duration, DurationRound, NaiveDateTime, Timelike};

/// Wall-clock trigger for a stream's collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Minute `minute` of every hour.
    HourlyAt { minute: u32 },
    /// `00:minute` and `12:minute`.
    TwiceDailyAt { minute: u32 },
}

impl Trigger {
    /// First firing strictly after `after`.
    pub fn next_fire(&self, after: NaiveDateTime) -> NaiveDateTime {
        let (step, minute) = match *self {
            Trigger::HourlyAt { minute } => (Duration::hours(1), minute.min(59)),
            Trigger::TwiceDailyAt { minute } => (Duration::hours(12), minute.min(59)),
        };
        let hour_floor = after
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);
        let block_start = match *self {
            Trigger::HourlyAt { .. } => hour_floor,
            Trigger::TwiceDailyAt { .. } => hour_floor - Duration::hours(i64::from(hour_floor.hour() % 12)),
        };
        let candidate = block_start + Duration::minutes(i64::from(minute));
        if candidate > after {
            candidate
        } else {
            candidate + step
        }
    }

    /// Slot a firing at `fired_at` collects: the hour or shift boundary it
    /// follows.
    pub fn slot_for(&self, fired_at: NaiveDateTime) -> NaiveDateTime {
        let step = match self {
            Trigger::HourlyAt { .. } => Duration::hours(1),
            Trigger::TwiceDailyAt { .. } => Duration::hours(12),
        };
        fired_at.duration_trunc(step).unwrap_or(fired_at)
    }

    /// Time to wait from `now` until the next firing after `last`.
    pub fn delay(&self, now: NaiveDateTime, last: Option<NaiveDateTime>) -> (NaiveDateTime, std::time::Duration) {
        let after = last.map_or(now, |last| last.max(now));
        let fire_at = self.next_fire(after);
        let wait = (fire_at - now).to_std().unwrap_or_default();
        (fire_at, wait)
    }
}
