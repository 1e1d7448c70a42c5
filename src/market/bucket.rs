use crate::error::AppError;
use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, SubsecRound, TimeDelta, Timelike, Utc};

pub const BUCKET_KEY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketGranularity {
    Minute,
    Day,
    IsoWeekEnd,
}

pub fn truncate_to_second(value: DateTime<Utc>) -> DateTime<Utc> {
    value.trunc_subsecs(0)
}

pub fn truncate_to_minute(value: DateTime<Utc>) -> DateTime<Utc> {
    let whole_seconds = truncate_to_second(value);
    whole_seconds - TimeDelta::seconds(i64::from(whole_seconds.second()))
}

pub fn truncate_to_day(value: DateTime<Utc>) -> DateTime<Utc> {
    value.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Midnight of the Sunday closing the ISO week that contains `value`.
pub fn iso_week_end(value: DateTime<Utc>) -> DateTime<Utc> {
    let date = value.date_naive();
    let days_to_sunday = 6 - i64::from(date.weekday().num_days_from_monday());
    (date + TimeDelta::days(days_to_sunday))
        .and_time(NaiveTime::MIN)
        .and_utc()
}

pub fn bucket_start(granularity: BucketGranularity, value: DateTime<Utc>) -> DateTime<Utc> {
    match granularity {
        BucketGranularity::Minute => truncate_to_minute(value),
        BucketGranularity::Day => truncate_to_day(value),
        BucketGranularity::IsoWeekEnd => iso_week_end(value),
    }
}

pub fn format_bucket_key(value: DateTime<Utc>) -> String {
    value.format(BUCKET_KEY_FORMAT).to_string()
}

pub fn parse_bucket_key(value: &str) -> Result<DateTime<Utc>, AppError> {
    Ok(NaiveDateTime::parse_from_str(value, BUCKET_KEY_FORMAT)?.and_utc())
}

pub fn datetime_from_ms(value: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp_millis(value).ok_or(AppError::TimestampRange(value))
}
