//! Deadline arithmetic and urgency classification.
//!
//! `days_remaining` is the ceiling of the remaining time in whole days, so a
//! deadline one second away counts as one day left and a deadline that has
//! just passed counts as zero.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::models::{RawRecord, Record, Urgency};

const SECONDS_PER_DAY: i64 = 86_400;
const NANOS_PER_DAY: i64 = SECONDS_PER_DAY * 1_000_000_000;

/// Days shown as `warning` rather than `normal`.
pub const WARNING_WINDOW_DAYS: i64 = 2;

const PORTAL_DATE_FORMATS: [&str; 2] = ["%d/%m/%Y %H:%M", "%d/%m/%Y %I:%M %p"];

fn ceil_div(value: i64, divisor: i64) -> i64 {
  let quotient = value.div_euclid(divisor);
  if value.rem_euclid(divisor) > 0 { quotient + 1 } else { quotient }
}

pub fn days_remaining(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
  let delta = deadline - now;
  match delta.num_nanoseconds() {
    Some(nanos) => ceil_div(nanos, NANOS_PER_DAY),
    // Beyond ~292 years nanosecond precision is irrelevant.
    None => ceil_div(delta.num_seconds(), SECONDS_PER_DAY),
  }
}

pub fn classify(days_remaining: Option<i64>) -> Urgency {
  match days_remaining {
    Some(days) if days <= 0 => Urgency::Urgent,
    Some(days) if days <= WARNING_WINDOW_DAYS => Urgency::Warning,
    _ => Urgency::Normal,
  }
}

pub fn assess(raw: RawRecord, now: DateTime<Utc>) -> Record {
  let days = raw.deadline.map(|deadline| days_remaining(deadline, now));
  Record {
    title: raw.title,
    course: raw.course,
    deadline: raw.deadline,
    days_remaining: days,
    urgency: classify(days),
    submission: raw.submission,
    url: raw.url,
  }
}

pub fn assess_all(raw: Vec<RawRecord>, now: DateTime<Utc>) -> Vec<Record> {
  raw.into_iter().map(|record| assess(record, now)).collect()
}

/// Parses the portal's `dd/mm/YYYY` dates (optionally followed by a time).
/// Dates without a time are taken as midnight UTC.
pub fn parse_portal_date(text: &str) -> Option<DateTime<Utc>> {
  let text = text.trim();
  if let Ok(date) = NaiveDate::parse_from_str(text, "%d/%m/%Y") {
    return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
  }
  PORTAL_DATE_FORMATS
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    .map(|dt| dt.and_utc())
}
