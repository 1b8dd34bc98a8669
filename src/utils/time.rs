use chrono::{DateTime, FixedOffset, TimeZone, Utc};

/// Timestamp format used inside change-log entries: local time with milliseconds and offset,
/// e.g. `2024-05-01T09:30:00.000+02:00`.
pub fn to_change_log_time<Tz: TimeZone>(time: &DateTime<Utc>, zone: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.with_timezone(zone)
        .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        .to_string()
}

/// Stem shared by the full image and the thumbnail of one capture:
/// `date_time_offset_width_height_token_0`.
pub fn screenshot_file_stem(
    captured_at: &DateTime<FixedOffset>,
    width: u32,
    height: u32,
    token: &str,
) -> String {
    let offset = captured_at.format("%:z").to_string().replace(':', "-");
    format!(
        "{}_{}_{offset}_{width}_{height}_{token}_0",
        captured_at.format("%Y-%m-%d"),
        captured_at.format("%H-%M-%S"),
    )
}

/// Date bucket the screenshot sink files an upload under.
pub fn sink_date<Tz: TimeZone>(time: &DateTime<Utc>, zone: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.with_timezone(zone).format("%Y-%m-%d").to_string()
}
