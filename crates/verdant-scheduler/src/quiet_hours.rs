//! Quiet-hours gate — defers delivery out of a do-not-disturb window.
//!
//! The window is a pair of "HH:MM" strings and may cross midnight
//! (22:00–07:00). Inclusive at both ends, in both shapes. Malformed time
//! strings disable the gate entirely: a notification is deferred or sent
//! on time, never silently dropped.

use chrono::{DateTime, Duration, Timelike, Utc};

/// Step size when walking a blocked candidate forward.
const STEP_MINUTES: i64 = 30;

/// A parsed quiet-hours window in minutes-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    start_min: u32,
    end_min: u32,
}

impl QuietWindow {
    /// Parse a window from "HH:MM" strings. Returns None (gate disabled)
    /// on any malformed input: wrong part count, non-numeric fields,
    /// hour outside 0-23 or minute outside 0-59.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        let start_min = parse_hhmm(start)?;
        let end_min = parse_hhmm(end)?;
        Some(Self { start_min, end_min })
    }

    /// Whether a minute-of-day falls inside the blocked window.
    /// `start <= end` blocks [start, end]; `start > end` crosses
    /// midnight and blocks [start, 1440) ∪ [0, end].
    pub fn blocks(&self, minute_of_day: u32) -> bool {
        if self.start_min <= self.end_min {
            minute_of_day >= self.start_min && minute_of_day <= self.end_min
        } else {
            minute_of_day >= self.start_min || minute_of_day <= self.end_min
        }
    }
}

/// Parse "HH:MM" into minute-of-day.
fn parse_hhmm(s: &str) -> Option<u32> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let hour: u32 = parts[0].trim().parse().ok()?;
    let minute: u32 = parts[1].trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}

/// The next instant at or after `candidate` outside the quiet-hours
/// window. Blocked candidates advance in 30-minute increments until
/// clear. Malformed windows fail open: the candidate comes back
/// unchanged.
pub fn next_allowed_instant(
    candidate: DateTime<Utc>,
    quiet_start: &str,
    quiet_end: &str,
) -> DateTime<Utc> {
    let Some(window) = QuietWindow::parse(quiet_start, quiet_end) else {
        tracing::warn!(
            "⚠️ Malformed quiet hours '{}'–'{}', gate disabled",
            quiet_start,
            quiet_end
        );
        return candidate;
    };

    let mut t = candidate;
    // A full day of 30-minute steps bounds the walk even for a window
    // covering every minute.
    for _ in 0..(24 * 60 / STEP_MINUTES) {
        if !window.blocks(t.hour() * 60 + t.minute()) {
            return t;
        }
        t += Duration::minutes(STEP_MINUTES);
    }
    t
}

/// Gate helper over optional settings: no window configured means no
/// deferral.
pub fn gate(
    candidate: DateTime<Utc>,
    quiet_start: Option<&str>,
    quiet_end: Option<&str>,
) -> DateTime<Utc> {
    match (quiet_start, quiet_end) {
        (Some(s), Some(e)) => next_allowed_instant(candidate, s, e),
        _ => candidate,
    }
}
