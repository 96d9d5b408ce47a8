//! Deadline classification shared by listings, saved lists and reminders.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRITICAL_MAX_DAYS: i64 = 7;
pub const WARNING_MAX_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrgencyBucket {
    Expired,
    Critical,
    Warning,
    None,
}

impl UrgencyBucket {
    pub fn from_days_remaining(days: i64) -> Self {
        match days {
            d if d < 0 => UrgencyBucket::Expired,
            0..=CRITICAL_MAX_DAYS => UrgencyBucket::Critical,
            d if d <= WARNING_MAX_DAYS => UrgencyBucket::Warning,
            _ => UrgencyBucket::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyBucket::Expired => "EXPIRED",
            UrgencyBucket::Critical => "CRITICAL",
            UrgencyBucket::Warning => "WARNING",
            UrgencyBucket::None => "NONE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EXPIRED" => Some(UrgencyBucket::Expired),
            "CRITICAL" => Some(UrgencyBucket::Critical),
            "WARNING" => Some(UrgencyBucket::Warning),
            "NONE" => Some(UrgencyBucket::None),
            _ => None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, UrgencyBucket::None)
    }
}

/// Whole days from `now` until `deadline`. Both are calendar dates at the UTC
/// midnight boundary, so the ceiling of the fractional difference is exact.
pub fn days_remaining(deadline: NaiveDate, now: NaiveDate) -> i64 {
    (deadline - now).num_days()
}

pub fn classify(deadline: Option<NaiveDate>, now: NaiveDate) -> UrgencyBucket {
    match deadline {
        Some(deadline) => UrgencyBucket::from_days_remaining(days_remaining(deadline, now)),
        None => UrgencyBucket::None,
    }
}

/// The calendar date an evaluation pass runs against.
pub fn evaluation_date(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

/// Days remaining plus bucket, as shown next to a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineStatus {
    pub days_remaining: i64,
    pub bucket: UrgencyBucket,
    pub label: String,
}

impl DeadlineStatus {
    pub fn for_deadline(deadline: Option<NaiveDate>, now: NaiveDate) -> Option<Self> {
        let deadline = deadline?;
        let days = days_remaining(deadline, now);
        let label = match days {
            d if d < 0 => "Expired".to_string(),
            0 => "Due today".to_string(),
            1 => "1 day left".to_string(),
            d => format!("{d} days left"),
        };
        Some(Self {
            days_remaining: days,
            bucket: UrgencyBucket::from_days_remaining(days),
            label,
        })
    }
}
