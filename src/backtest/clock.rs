//! Simulation Clock
//!
//! Logical time for the driver loop. Time only moves when an event is
//! dispatched; nothing in the simulation path reads the system clock.

use std::fmt;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SEC;

/// Monotonic simulation clock.
///
/// `advance_to` refuses to move backward; the driver loop treats a refusal as
/// a causality violation.
#[derive(Debug, Clone)]
pub struct SimClock {
    current: Nanos,
    started: bool,
}

impl SimClock {
    /// Create a clock positioned at `start_time`.
    #[inline]
    pub fn new(start_time: Nanos) -> Self {
        Self {
            current: start_time,
            started: false,
        }
    }

    /// Current simulation time in nanoseconds.
    #[inline]
    pub fn now(&self) -> Nanos {
        self.current
    }

    /// Whether any event has advanced the clock yet.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Advance to `new_time`. Returns `false` (and leaves the clock untouched)
    /// if `new_time` lies in the past.
    #[inline]
    pub fn advance_to(&mut self, new_time: Nanos) -> bool {
        if self.started && new_time < self.current {
            return false;
        }
        self.current = new_time;
        self.started = true;
        true
    }

    /// Check if a time is strictly before the current clock.
    #[inline]
    pub fn is_past(&self, time: Nanos) -> bool {
        self.started && time < self.current
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for SimClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_nanos(self.current))
    }
}

/// Convert a chrono DateTime to Nanos.
#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Convert Nanos to a chrono DateTime. Out-of-range values yield `None`.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc.timestamp_opt(secs, nsecs).single()
}

/// Zone-less datetime layouts, read as UTC.
const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse an RFC3339 timestamp, a zone-less `YYYY-MM-DD HH:MM[:SS[.f]]`
/// datetime (space or `T` separated, UTC), or a bare `YYYY-MM-DD` date
/// (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(datetime_to_nanos(&dt.with_timezone(&chrono::Utc)));
    }
    if let Some(naive) = NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        return Some(datetime_to_nanos(&naive.and_utc()));
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| datetime_to_nanos(&naive.and_utc()))
}

/// Human-readable rendering for logs and diagnostics.
pub fn format_nanos(nanos: Nanos) -> String {
    match nanos_to_datetime(nanos) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        None => format!("{}ns", nanos),
    }
}
