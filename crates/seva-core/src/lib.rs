//! Core domain model for SchemeSeva: schemes, bookmarks, profiles and the
//! deadline/reminder logic that runs over them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod deadline;
pub mod reminders;

pub use deadline::{classify, days_remaining, evaluation_date, DeadlineStatus, UrgencyBucket};
pub use reminders::{generate, Generated, NotificationRecord};

pub const CRATE_NAME: &str = "seva-core";

/// Eligibility criteria as scraped: either prose or a structured object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Eligibility {
    Text(String),
    Structured(JsonValue),
}

impl Eligibility {
    pub fn is_blank(&self) -> bool {
        match self {
            Eligibility::Text(text) => text.trim().is_empty(),
            Eligibility::Structured(value) => value.is_null(),
        }
    }
}

/// Dedup key for a scheme: normalized name plus source URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemeKey {
    pub name: String,
    pub source_url: String,
}

impl SchemeKey {
    pub fn new(name: &str, source_url: &str) -> Self {
        Self {
            name: normalize_key_fragment(name),
            source_url: source_url.trim().trim_end_matches('/').to_string(),
        }
    }

    /// Stable identifier for the scheme addressed by this key.
    pub fn scheme_id(&self) -> Uuid {
        let source = format!("{}#{}", self.source_url, self.name);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
    }
}

/// Lowercases and collapses every non-alphanumeric run into a single space.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scheme record as delivered by a scrape source, before validation.
///
/// Every field is optional on the wire so that malformed records still
/// deserialize and can be rejected with a reason instead of failing the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSchemeData {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub eligibility_criteria: Option<Eligibility>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub source_url: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Validated, pre-persistence handoff from the ingestion pipeline into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeDraft {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub eligibility: Option<Eligibility>,
    pub deadline: Option<NaiveDate>,
    pub source_url: String,
}

impl SchemeDraft {
    pub fn key(&self) -> SchemeKey {
        SchemeKey::new(&self.name, &self.source_url)
    }

    /// New active scheme row for a draft that matched nothing in the store.
    pub fn into_scheme(self, now: DateTime<Utc>) -> Scheme {
        Scheme {
            id: self.key().scheme_id(),
            name: self.name,
            description: self.description,
            category: self.category,
            eligibility: self.eligibility,
            deadline: self.deadline,
            source_url: self.source_url,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persisted government scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scheme {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub eligibility: Option<Eligibility>,
    pub deadline: Option<NaiveDate>,
    pub source_url: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scheme {
    /// Re-scrape update: only the mutable fields change, identity and the
    /// active flag are left alone.
    pub fn apply_draft(&mut self, draft: SchemeDraft, now: DateTime<Utc>) {
        self.description = draft.description;
        self.category = draft.category;
        self.eligibility = draft.eligibility;
        self.deadline = draft.deadline;
        self.updated_at = now;
    }

    pub fn deadline_status(&self, now: NaiveDate) -> Option<DeadlineStatus> {
        DeadlineStatus::for_deadline(self.deadline, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub user_id: Uuid,
    pub scheme_id: Uuid,
    pub saved_at: DateTime<Utc>,
}

/// A bookmark joined with its scheme row. `scheme` is `None` when the row
/// the bookmark points at could not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkedScheme {
    pub bookmark: Bookmark,
    pub scheme: Option<Scheme>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub name: String,
    pub age: u32,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub community_category: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub education: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("age must be a positive integer")]
    NonPositiveAge,
    #[error("contact email {0:?} is not an address")]
    InvalidEmail(String),
}

impl UserProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        if self.age == 0 {
            return Err(ProfileError::NonPositiveAge);
        }
        if let Some(email) = &self.contact_email {
            let trimmed = email.trim();
            let valid = trimmed
                .split_once('@')
                .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
                .unwrap_or(false);
            if !valid {
                return Err(ProfileError::InvalidEmail(email.clone()));
            }
        }
        Ok(())
    }
}

/// Non-scheme content a user pinned from the dashboard (e.g. the info section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedNote {
    pub id: Uuid,
    pub user_id: Uuid,
    pub section_key: String,
    pub title: String,
    pub body: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl SavedNote {
    pub fn new(
        user_id: Uuid,
        section_key: impl Into<String>,
        title: impl Into<String>,
        body: Option<String>,
        saved_at: DateTime<Utc>,
    ) -> Self {
        let section_key = section_key.into();
        let source = format!("{user_id}:{section_key}");
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes()),
            user_id,
            section_key,
            title: title.into(),
            body,
            saved_at,
        }
    }
}

/// Last bucket a user was reminded about for a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationWatermark {
    pub user_id: Uuid,
    pub scheme_id: Uuid,
    pub bucket: UrgencyBucket,
    pub notified_at: DateTime<Utc>,
}
