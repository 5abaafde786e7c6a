//! Human-readable renderings of second counts used in progress entries.

/// Format a remaining-time estimate: `42s`, `12 min` or `1h 5m`
pub fn format_remaining(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    if seconds < 60.0 {
        format!("{}s", seconds as u64)
    } else if seconds < 3600.0 {
        format!("{} min", (seconds / 60.0) as u64)
    } else {
        let hours = (seconds / 3600.0) as u64;
        let minutes = ((seconds % 3600.0) / 60.0) as u64;
        format!("{}h {}m", hours, minutes)
    }
}

/// Format an elapsed wall-clock time as `H:MM:SS`
pub fn format_elapsed(seconds: f64) -> String {
    let total = if seconds.is_finite() { seconds.max(0.0) as u64 } else { 0 };
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Format the observed media duration, `unknown` when the probe failed
pub fn format_observed(seconds: f64) -> String {
    if seconds > 0.0 {
        format_remaining(seconds)
    } else {
        "unknown".to_string()
    }
}

/// Round to one decimal place, as stored in `progress_percentage`
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to two decimal places, as stored in second counts
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
