/// Utility functions for timing and formatting
use time::{format_description, OffsetDateTime};
use tokio::time::Instant;

use crate::models::Snapshot;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Seconds from `start` to `now`, zero if `now` is earlier
pub fn elapsed_seconds(start: Instant, now: Instant) -> f64 {
    now.saturating_duration_since(start).as_secs_f64()
}

/// Intensity ratio as a whole percentage clamped to 0..=100
///
/// The pipeline publishes the raw ratio; clamping is a presentation concern.
pub fn ratio_percent(ratio: f64) -> u8 {
    (ratio.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// One-line summary of a snapshot for the console
pub fn format_summary(snapshot: &Snapshot) -> String {
    let mut line = format!(
        "{} | Analog: {} | Average: {:.2} ms | Intensity: {} ({}%) | Type: {}",
        snapshot.status,
        snapshot.latest_analog,
        snapshot.latest_average,
        snapshot.intensity_band.label(),
        ratio_percent(snapshot.intensity_ratio),
        snapshot.category_label,
    );

    if snapshot.category_index >= 0 {
        line.push_str(&format!(" @ {:.2} ms", snapshot.category_average));
    }

    line.push_str(&format!(" | Chart: {} points", snapshot.series.len()));
    if snapshot.dropped_payloads > 0 {
        line.push_str(&format!(
            " | Dropped: {}/{}",
            snapshot.dropped_payloads, snapshot.received_payloads
        ));
    }
    line
}
