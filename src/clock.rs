//! Time-of-day conversions and the clock abstraction driving the timers.
//!
//! Daytimes are recurring instants stored as milliseconds since epoch day zero.
//! Values entered in a local time zone are shifted by the difference between the
//! absolute UTC offsets of "now" and of the converted instant.

use chrono::{DateTime, NaiveTime, Offset, TimeZone, Timelike, Utc};
use core::fmt;
use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

pub const SECS_PER_DAY: i64 = 86_400;
pub const MS_PER_MINUTE: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    InvalidTimeOfDay(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::InvalidTimeOfDay(s) => write!(f, "invalid time of day: {:?}", s),
        }
    }
}

impl Error for ClockError {}

/// Monotonic instants for timers plus wall-clock time for daytime math.
pub trait Clock {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

/// Correction in milliseconds between two UTC offsets given in minutes.
///
/// Only the magnitudes are compared, so zones on opposite sides of UTC are not
/// corrected symmetrically.
pub fn offset_correction_ms(local_offset_min: i32, target_offset_min: i32) -> i64 {
    (i64::from(local_offset_min.abs()) - i64::from(target_offset_min.abs())) * MS_PER_MINUTE
}

fn offset_minutes_at<Tz: TimeZone>(tz: &Tz, at: DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&at.naive_utc()).fix().local_minus_utc() / 60
}

/// Milliseconds missing from `timestamp` when shown with the offset that applies `now`.
pub fn missing_offset_for_local<Tz: TimeZone>(tz: &Tz, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    offset_correction_ms(offset_minutes_at(tz, now), offset_minutes_at(tz, timestamp))
}

/// Map a stored daytime onto the time of day it represents in `tz` today.
pub fn to_local_time_of_day<Tz: TimeZone>(tz: &Tz, timestamp_ms: i64, now: DateTime<Utc>) -> i64 {
    match DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        Some(ts) => timestamp_ms + missing_offset_for_local(tz, ts, now),
        None => timestamp_ms,
    }
}

/// `HH:MM` display of a stored daytime in `tz`.
pub fn format_time_of_day<Tz: TimeZone>(tz: &Tz, timestamp_ms: i64, now: DateTime<Utc>) -> String
where
    Tz::Offset: fmt::Display,
{
    let corrected = to_local_time_of_day(tz, timestamp_ms, now);
    match DateTime::<Utc>::from_timestamp_millis(corrected) {
        Some(ts) => ts.with_timezone(tz).format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

/// Parse `HH:MM[:SS]` typed in `tz` into a stored daytime.
///
/// The text is read on day zero (the local date of the unix epoch) and the offset
/// correction of [`to_local_time_of_day`] is subtracted, so both directions agree.
pub fn parse_time_of_day_input<Tz: TimeZone>(tz: &Tz, text: &str, now: DateTime<Utc>) -> Result<i64, ClockError> {
    let trimmed = text.trim();
    let time = NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| ClockError::InvalidTimeOfDay(trimmed.to_string()))?;

    // DateTime<Utc>::default() is the unix epoch
    let day_zero = DateTime::<Utc>::default().with_timezone(tz).date_naive();
    let local = tz
        .from_local_datetime(&day_zero.and_time(time))
        .earliest()
        .ok_or_else(|| ClockError::InvalidTimeOfDay(trimmed.to_string()))?;
    let unix = local.with_timezone(&Utc);

    Ok(unix.timestamp_millis() - missing_offset_for_local(tz, unix, now))
}

/// Seconds elapsed since the last UTC midnight, 0..=86399.
pub fn day_boundary<Tz: TimeZone>(date: &DateTime<Tz>) -> u32 {
    date.timestamp().rem_euclid(SECS_PER_DAY) as u32
}

/// The UTC hours/minutes/seconds of `now` placed on day zero, in milliseconds.
pub fn utc_time_of_day_ms(now: DateTime<Utc>) -> i64 {
    i64::from(now.num_seconds_from_midnight()) * 1000
}
