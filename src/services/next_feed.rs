//! Next upcoming feeding instant of the active schedule.
//!
//! The active schedule is the one that is both selected and active; a paused
//! schedule has no next feed.

use crate::clock::utc_time_of_day_ms;
use crate::models::feeder::{HistoryData, Schedule, ScheduleMode};
use chrono::{DateTime, Utc};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextFeed {
    /// One of the schedule's daytimes, in day-zero milliseconds.
    At { daytime_ms: i64 },
    /// No fixed instant: up to `per_day` portions from `window_start_ms` on.
    MaxTimes { per_day: u32, window_start_ms: Option<i64> },
}

/// First daytime strictly after `now_secs` (seconds of the day), wrapping to the
/// first daytime of the next day. `daytimes` must be sorted ascending.
pub fn next_daytime_after(daytimes: &[i64], now_secs: i64) -> Option<i64> {
    daytimes
        .iter()
        .copied()
        .find(|d| *d > now_secs * 1000)
        .or_else(|| daytimes.first().copied())
}

/// Next feeding daytime for `now`, compared on UTC time of day.
pub fn next_feed(daytimes: &[i64], now: DateTime<Utc>) -> Option<i64> {
    let mut sorted = daytimes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    next_daytime_after(&sorted, utc_time_of_day_ms(now) / 1000)
}

#[derive(Debug, Default)]
pub struct NextFeedCalculator {
    active: Option<Schedule>,
    current: Option<NextFeed>,
}

impl NextFeedCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_schedule(&self) -> Option<&Schedule> {
        self.active.as_ref()
    }

    pub fn current(&self) -> Option<NextFeed> {
        self.current
    }

    /// Track the active schedule of a freshly published collection.
    pub fn on_schedules(&mut self, schedules: &[Schedule], now: DateTime<Utc>) -> Option<NextFeed> {
        self.active = schedules.iter().find(|s| s.is_current()).cloned();
        self.recompute(now)
    }

    /// Feeding events can consume a slot before the clock passes it.
    ///
    /// Returns `None` when the delta does not call for a recomputation.
    pub fn on_history_delta(&mut self, delta: &HistoryData, now: DateTime<Utc>) -> Option<Option<NextFeed>> {
        let feeding = delta.events.iter().any(|e| e.kind.is_feeding());
        if !feeding || self.active.is_none() {
            return None;
        }
        Some(self.recompute(now))
    }

    pub fn recompute(&mut self, now: DateTime<Utc>) -> Option<NextFeed> {
        self.current = self.active.as_ref().and_then(|s| match s.mode {
            ScheduleMode::FixedDaytime => next_feed(&s.daytimes, now).map(|daytime_ms| NextFeed::At { daytime_ms }),
            ScheduleMode::MaxTimes => Some(NextFeed::MaxTimes {
                per_day: s.max_times,
                window_start_ms: s.max_times_start_time,
            }),
        });
        debug!("Next feed recomputed: {:?}", self.current);
        self.current
    }
}
