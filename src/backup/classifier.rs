//! Classification of rclone output lines into throughput signals.
//!
//! rclone runs with `--stats-one-line --log-level INFO`, so a healthy lane
//! prints lines such as
//!
//! ```text
//! 2024/05/05 10:00:00 INFO  :   1.204 GiB / 3.500 GiB, 34%, 12.5 MiB/s, ETA 3m8s
//! 2024/05/05 10:00:01 INFO  : photos/a.jpg: Copied (new)
//! ```
//!
//! while a throttled one keeps reporting `0 B/s, ETA -`. Only this module
//! knows the tool's output format.

use once_cell::sync::Lazy;
use regex::Regex;

/// Markers that mean work is being done: transfer counters, check counters,
/// per-file copy notices and a concrete ETA.
static ACTIVITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Transferred:|Checks:|: Copied \(|\bETA [0-9]").expect("activity pattern")
});

/// An instantaneous rate of exactly zero. `10 B/s` or `1.0 B/s` must not match.
static ZERO_SPEED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9.,])0 B/s").expect("zero speed pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Activity,
    ZeroSpeed,
    Other,
}

/// Classify one output line. Activity wins over a zero rate on the same line.
pub fn classify(line: &str) -> LineClass {
    if ACTIVITY.is_match(line) {
        LineClass::Activity
    } else if ZERO_SPEED.is_match(line) {
        LineClass::ZeroSpeed
    } else {
        LineClass::Other
    }
}
