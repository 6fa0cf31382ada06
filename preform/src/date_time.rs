use std::time::{SystemTime, UNIX_EPOCH};

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn seconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Format the current date as "Mmm dd yyyy" for `__DATE__` (UTC)
pub fn format_date() -> String {
    format_date_at(seconds_since_epoch())
}

/// Format the current time as "hh:mm:ss" for `__TIME__` (UTC)
pub fn format_time() -> String {
    format_time_at(seconds_since_epoch())
}

pub(crate) fn format_date_at(epoch_seconds: u64) -> String {
    let (year, month, day) = civil_from_days(epoch_seconds / 86400);
    format!("{} {day:2} {year}", MONTH_NAMES[month - 1])
}

/// Convert days since 1970-01-01 to (year, month 1-12, day 1-31)
///
/// Works in 400-year eras starting on March 1st so that the leap day is the
/// last day of each computed year.
const fn civil_from_days(days: u64) -> (u64, usize, u64) {
    // 719_468 days from 0000-03-01 to 1970-01-01
    let days = days + 719_468;
    let era = days / 146_097;
    let day_of_era = days % 146_097;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let shifted_month = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * shifted_month + 2) / 5 + 1;
    let month = if shifted_month < 10 { shifted_month + 3 } else { shifted_month - 9 };
    let year = year_of_era + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month as usize, day)
}

pub(crate) fn format_time_at(epoch_seconds: u64) -> String {
    let seconds_today = epoch_seconds % 86400;
    let hours = seconds_today / 3600;
    let minutes = (seconds_today % 3600) / 60;
    let seconds = seconds_today % 60;

    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
