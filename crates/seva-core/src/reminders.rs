//! Turns a set of bookmarked schemes into deadline reminder records.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deadline::{days_remaining, UrgencyBucket};
use crate::BookmarkedScheme;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub user_id: Uuid,
    pub scheme_id: Uuid,
    pub scheme_name: String,
    pub deadline: NaiveDate,
    pub days_remaining: i64,
    pub bucket: UrgencyBucket,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Generated {
    pub records: Vec<NotificationRecord>,
    /// Bookmarks whose scheme row was missing.
    pub skipped_missing: usize,
}

/// Builds the reminder list for `bookmarks` as of `now`.
///
/// Only EXPIRED, CRITICAL and WARNING deadlines produce a record. At most one
/// record is produced per (user, scheme). Output is ordered by days remaining,
/// then scheme name, then user and scheme id, so identical inputs always yield
/// identical output.
pub fn generate(bookmarks: &[BookmarkedScheme], now: NaiveDate) -> Generated {
    let mut skipped_missing = 0usize;
    let mut by_pair: BTreeMap<(Uuid, Uuid), NotificationRecord> = BTreeMap::new();

    for entry in bookmarks {
        let Some(scheme) = &entry.scheme else {
            skipped_missing += 1;
            continue;
        };
        let Some(deadline) = scheme.deadline else {
            continue;
        };
        let days = days_remaining(deadline, now);
        let bucket = UrgencyBucket::from_days_remaining(days);
        if !bucket.is_actionable() {
            continue;
        }
        by_pair
            .entry((entry.bookmark.user_id, scheme.id))
            .or_insert_with(|| NotificationRecord {
                user_id: entry.bookmark.user_id,
                scheme_id: scheme.id,
                scheme_name: scheme.name.clone(),
                deadline,
                days_remaining: days,
                bucket,
            });
    }

    let mut records = by_pair.into_values().collect::<Vec<_>>();
    records.sort_by(|a, b| {
        a.days_remaining
            .cmp(&b.days_remaining)
            .then_with(|| a.scheme_name.cmp(&b.scheme_name))
            .then_with(|| a.user_id.cmp(&b.user_id))
            .then_with(|| a.scheme_id.cmp(&b.scheme_id))
    });

    Generated {
        records,
        skipped_missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bookmark, Scheme, SchemeDraft};
    use chrono::{Duration, TimeZone, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn scheme(name: &str, offset_days: Option<i64>) -> Scheme {
        SchemeDraft {
            name: name.to_string(),
            description: None,
            category: None,
            eligibility: None,
            deadline: offset_days.map(|d| today() + Duration::days(d)),
            source_url: format!("https://schemes.gov.in/{}", name.to_lowercase().replace(' ', "-")),
        }
        .into_scheme(Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).single().unwrap())
    }

    fn saved(user_id: Uuid, scheme: Option<Scheme>) -> BookmarkedScheme {
        BookmarkedScheme {
            bookmark: Bookmark {
                user_id,
                scheme_id: scheme.as_ref().map(|s| s.id).unwrap_or_else(Uuid::new_v4),
                saved_at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap(),
            },
            scheme,
        }
    }

    #[test]
    fn orders_expired_then_critical_then_warning_and_drops_none() {
        let user = Uuid::new_v4();
        let bookmarks = vec![
            saved(user, Some(scheme("Warning Scheme", Some(20)))),
            saved(user, Some(scheme("Far Scheme", Some(90)))),
            saved(user, Some(scheme("No Deadline", None))),
            saved(user, Some(scheme("Today Scheme", Some(0)))),
            saved(user, Some(scheme("Lapsed Scheme", Some(-5)))),
        ];

        let out = generate(&bookmarks, today());
        let buckets = out.records.iter().map(|r| r.bucket).collect::<Vec<_>>();
        assert_eq!(
            buckets,
            vec![UrgencyBucket::Expired, UrgencyBucket::Critical, UrgencyBucket::Warning]
        );
        let days = out.records.iter().map(|r| r.days_remaining).collect::<Vec<_>>();
        assert_eq!(days, vec![-5, 0, 20]);
        assert!(out.records.iter().all(|r| r.bucket != UrgencyBucket::None));
        assert_eq!(out.skipped_missing, 0);
    }

    #[test]
    fn ties_break_on_scheme_name() {
        let user = Uuid::new_v4();
        let bookmarks = vec![
            saved(user, Some(scheme("Zeta Pension", Some(3)))),
            saved(user, Some(scheme("Alpha Scholarship", Some(3)))),
        ];
        let out = generate(&bookmarks, today());
        let names = out.records.iter().map(|r| r.scheme_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Alpha Scholarship", "Zeta Pension"]);
    }

    #[test]
    fn missing_schemes_are_counted_not_fatal() {
        let user = Uuid::new_v4();
        let bookmarks = vec![
            saved(user, None),
            saved(user, Some(scheme("Housing Grant", Some(10)))),
            saved(user, None),
        ];
        let out = generate(&bookmarks, today());
        assert_eq!(out.skipped_missing, 2);
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn repeated_bookmark_yields_one_record() {
        let user = Uuid::new_v4();
        let s = scheme("Crop Insurance", Some(6));
        let bookmarks = vec![saved(user, Some(s.clone())), saved(user, Some(s))];
        assert_eq!(generate(&bookmarks, today()).records.len(), 1);
    }

    #[test]
    fn same_scheme_for_two_users_yields_two_records() {
        let s = scheme("Crop Insurance", Some(6));
        let bookmarks = vec![
            saved(Uuid::new_v4(), Some(s.clone())),
            saved(Uuid::new_v4(), Some(s)),
        ];
        assert_eq!(generate(&bookmarks, today()).records.len(), 2);
    }

    #[test]
    fn generation_is_idempotent() {
        let user = Uuid::new_v4();
        let bookmarks = (0..12)
            .map(|i| saved(user, Some(scheme(&format!("Scheme {i}"), Some(i * 4 - 10)))))
            .collect::<Vec<_>>();
        let first = generate(&bookmarks, today());
        let second = generate(&bookmarks, today());
        assert_eq!(first, second);
    }
}
