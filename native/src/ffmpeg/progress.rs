//! Progress grammar over FFmpeg's stderr.
//!
//! Stderr is split into lines on both `\n` and `\r` (FFmpeg rewrites its status
//! line with carriage returns). A line containing `time=HH:MM:SS.ff` carries the
//! elapsed output time; a line containing `Duration: HH:MM:SS.ff` carries the
//! input duration. `time=N/A` and anything else is ignored. This is the only
//! place that knows the tool's text format.

use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration: (\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("invalid duration regex")
});
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("invalid time regex")
});

/// Highest percent reported before the process has exited successfully.
pub const MAX_RUNNING_PERCENT: u8 = 99;

fn hms_to_seconds(caps: &regex::Captures<'_>) -> f64 {
    let hours: f64 = caps[1].parse().unwrap_or(0.0);
    let minutes: f64 = caps[2].parse().unwrap_or(0.0);
    let seconds: f64 = caps[3].parse().unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds
}

/// Elapsed seconds from a `time=` marker.
pub fn parse_time_marker(line: &str) -> Option<f64> {
    TIME_RE.captures(line).map(|caps| hms_to_seconds(&caps))
}

/// Input duration from a `Duration:` header line.
pub fn parse_duration_marker(line: &str) -> Option<f64> {
    DURATION_RE
        .captures(line)
        .map(|caps| hms_to_seconds(&caps))
        .filter(|d| *d > 0.0)
}

/// `round(elapsed / duration * 100)`, clamped to [0, 99]. None when duration is unknown.
pub fn percent_for(elapsed: f64, duration: f64) -> Option<u8> {
    if !duration.is_finite() || duration <= 0.0 || !elapsed.is_finite() {
        return None;
    }
    let pct = (elapsed / duration * 100.0).round();
    Some(pct.clamp(0.0, MAX_RUNNING_PERCENT as f64) as u8)
}

/// Parse one stderr line. Returns (percent or None, duration in seconds or None).
///
/// A `Duration:` line only fills in the duration when the caller had none.
pub fn parse_ffmpeg_progress(line: &str, current_duration: Option<f64>) -> (Option<u8>, Option<f64>) {
    if current_duration.is_none()
        && let Some(duration) = parse_duration_marker(line)
    {
        return (None, Some(duration));
    }

    if let (Some(elapsed), Some(duration)) = (parse_time_marker(line), current_duration) {
        return (percent_for(elapsed, duration), Some(duration));
    }

    (None, current_duration)
}

/// Splits a byte stream into lines on `\n` and `\r`. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Trailing text with no terminator.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if !self.pending.is_empty() {
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
    }
}
