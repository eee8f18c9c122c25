//! Time utilities for kiwi
//!
//! Lease records carry wall-clock epoch seconds; reservation windows are
//! daily wall-clock ranges checked against the start of a lease.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `KIWI_MOCK_TIME` environment variable can be set
//! to override the system time for all time-sensitive operations. This is
//! useful for exercising reservation windows.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2025-12-25 14:30:00`)

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "KIWI_MOCK_TIME";

const MOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SECONDS_PER_DAY: u64 = 86_400;

/// Offset between mock time and real time, computed once per process.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // This is the internal implementation that wraps Local::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let mock_time_str = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            let Ok(naive_dt) = NaiveDateTime::parse_from_str(&mock_time_str, MOCK_TIME_FORMAT)
            else {
                tracing::warn!(
                    mock_time = %mock_time_str,
                    expected_format = MOCK_TIME_FORMAT,
                    "Invalid mock time format"
                );
                return None;
            };
            let Some(mock_dt) = Local.from_local_datetime(&naive_dt).single() else {
                tracing::warn!(
                    mock_time = %mock_time_str,
                    "Failed to convert mock time to local timezone"
                );
                return None;
            };
            let offset = mock_dt.signed_duration_since(chrono::Local::now());
            tracing::info!(
                mock_time = %mock_time_str,
                offset_secs = offset.num_seconds(),
                "Mock time enabled"
            );
            Some(offset)
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current local time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)] // This is the wrapper that provides mock time support
pub fn now() -> DateTime<Local> {
    let real_now = chrono::Local::now();

    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Seconds since the epoch with sub-second precision, as stored in lease records.
pub fn epoch_seconds<Tz: TimeZone>(dt: &DateTime<Tz>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

/// Format an epoch timestamp from a lease record for display.
pub fn format_epoch(secs: f64) -> String {
    let micros = (secs * 1_000_000.0) as i64;
    match DateTime::from_timestamp_micros(micros) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => format!("{secs}"),
    }
}

/// Helper to format durations in human-readable form
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Wall-clock time of day for reservation windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
}

impl WallClock {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    /// Returns seconds since midnight
    pub fn as_seconds_from_midnight(&self) -> u32 {
        (self.hour as u32) * 3600 + (self.minute as u32) * 60
    }
}

impl PartialOrd for WallClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WallClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_seconds_from_midnight()
            .cmp(&other.as_seconds_from_midnight())
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parse HH:MM time format
impl FromStr for WallClock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| "Expected HH:MM format".to_string())?;

        let hour: u8 = hour.parse().map_err(|_| "Invalid hour".to_string())?;
        let minute: u8 = minute.parse().map_err(|_| "Invalid minute".to_string())?;

        if hour >= 24 {
            return Err("Hour must be 0-23".into());
        }
        if minute >= 60 {
            return Err("Minute must be 0-59".into());
        }

        Ok(Self { hour, minute })
    }
}

/// A daily `[start, end)` window during which a node may be reserved.
///
/// An end earlier than the start spans midnight. Equal start and end
/// covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationWindow {
    pub start: WallClock,
    pub end: WallClock,
}

impl ReservationWindow {
    pub fn new(start: WallClock, end: WallClock) -> Self {
        Self { start, end }
    }

    /// Check if the given time of day falls within this window
    pub fn contains(&self, time: WallClock) -> bool {
        if self.start < self.end {
            time >= self.start && time < self.end
        } else if self.start > self.end {
            // Window crosses midnight (e.g., 22:00 - 02:00)
            time >= self.start || time < self.end
        } else {
            true
        }
    }

    /// The window as one or two `[start, end)` second ranges within a day
    fn day_spans(&self) -> Vec<(u64, u64)> {
        let start = self.start.as_seconds_from_midnight() as u64;
        let end = self.end.as_seconds_from_midnight() as u64;

        if start < end {
            vec![(start, end)]
        } else if start > end {
            vec![(start, SECONDS_PER_DAY), (0, end)]
        } else {
            vec![(0, SECONDS_PER_DAY)]
        }
    }
}

impl fmt::Display for ReservationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for ReservationWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("Expected HH:MM-HH:MM, got '{}'", s.trim()))?;
        Ok(Self::new(start.parse()?, end.parse()?))
    }
}

/// The set of daily windows configured for a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSchedule {
    windows: Vec<ReservationWindow>,
}

impl ReservationSchedule {
    pub fn new(windows: Vec<ReservationWindow>) -> Self {
        Self { windows }
    }

    pub fn windows(&self) -> &[ReservationWindow] {
        &self.windows
    }

    /// Whether a lease starting at `dt` and lasting `duration` lies entirely
    /// inside the allowed windows. Windows that touch (including across
    /// midnight) form one continuous reservable period.
    pub fn permits<Tz: TimeZone>(&self, dt: &DateTime<Tz>, duration: Duration) -> bool {
        self.permits_from(dt.time().num_seconds_from_midnight() as u64, duration)
    }

    fn permits_from(&self, begin: u64, duration: Duration) -> bool {
        let day = merge_spans(self.windows.iter().flat_map(|w| w.day_spans()).collect());
        if day == [(0, SECONDS_PER_DAY)] {
            return true;
        }

        let end = begin.saturating_add(duration.as_secs());
        // With a gap every day, nothing longer than two days can fit.
        if end > begin + 2 * SECONDS_PER_DAY {
            return false;
        }

        let tiled = merge_spans(
            (0..3)
                .flat_map(|d| {
                    day.iter()
                        .map(move |(a, b)| (a + d * SECONDS_PER_DAY, b + d * SECONDS_PER_DAY))
                })
                .collect(),
        );
        tiled.iter().any(|(a, b)| *a <= begin && end <= *b)
    }
}

impl fmt::Display for ReservationSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.windows.iter().map(|w| w.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Parse comma-separated `HH:MM-HH:MM` ranges
impl FromStr for ReservationSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let windows = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if windows.is_empty() {
            return Err("Reservation schedule has no windows".into());
        }
        Ok(Self::new(windows))
    }
}

fn merge_spans(mut spans: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    spans.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}
