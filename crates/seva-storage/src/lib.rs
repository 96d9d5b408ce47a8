//! Persistent store collaborator for SchemeSeva plus the shared HTTP client.
//!
//! [`SchemeStore`] is the only way the engine touches schemes, bookmarks,
//! profiles, saved notes and reminder watermarks. Uniqueness and referential
//! integrity are the store's job: a bookmark must point at an existing scheme,
//! and a user has at most one profile.

use async_trait::async_trait;
use seva_core::{
    Bookmark, BookmarkedScheme, NotificationWatermark, ProfileError, SavedNote, Scheme,
    SchemeDraft, UserProfile,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "seva-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("scheme {0} does not exist")]
    UnknownScheme(Uuid),
    #[error("invalid profile: {0}")]
    InvalidProfile(#[from] ProfileError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub scheme_id: Uuid,
    pub kind: UpsertKind,
}

#[async_trait]
pub trait SchemeStore: Send + Sync {
    /// Active schemes ordered by deadline (schemes without one last), then name.
    async fn list_active_schemes(&self) -> Result<Vec<Scheme>, StoreError>;

    async fn get_scheme(&self, scheme_id: Uuid) -> Result<Option<Scheme>, StoreError>;

    /// Inserts a new scheme or updates the mutable fields of the scheme with
    /// the same (name, source URL) key.
    async fn upsert_scheme(&self, draft: SchemeDraft) -> Result<UpsertOutcome, StoreError>;

    /// All-or-nothing variant of [`SchemeStore::upsert_scheme`].
    async fn upsert_schemes(
        &self,
        drafts: Vec<SchemeDraft>,
    ) -> Result<Vec<UpsertOutcome>, StoreError>;

    /// Explicit administrative (de)activation.
    async fn set_scheme_active(&self, scheme_id: Uuid, active: bool) -> Result<(), StoreError>;

    /// The user's bookmarks, newest first.
    async fn get_bookmarks(&self, user_id: Uuid) -> Result<Vec<BookmarkedScheme>, StoreError>;

    /// Idempotent: bookmarking twice returns the original bookmark.
    async fn add_bookmark(&self, user_id: Uuid, scheme_id: Uuid) -> Result<Bookmark, StoreError>;

    /// Returns whether a bookmark was removed.
    async fn remove_bookmark(&self, user_id: Uuid, scheme_id: Uuid) -> Result<bool, StoreError>;

    async fn list_bookmark_owners(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError>;

    /// Creates the profile on first save, updates it in place afterwards.
    async fn save_profile(&self, profile: UserProfile) -> Result<(), StoreError>;

    /// Upserts by (user, section key).
    async fn save_note(&self, note: SavedNote) -> Result<SavedNote, StoreError>;

    async fn list_notes(&self, user_id: Uuid) -> Result<Vec<SavedNote>, StoreError>;

    async fn delete_note(&self, user_id: Uuid, note_id: Uuid) -> Result<bool, StoreError>;

    async fn last_notified(
        &self,
        user_id: Uuid,
        scheme_id: Uuid,
    ) -> Result<Option<NotificationWatermark>, StoreError>;

    async fn record_notified(&self, watermark: NotificationWatermark) -> Result<(), StoreError>;
}

fn eligibility_to_json(draft: &SchemeDraft) -> Result<Option<JsonValue>, StoreError> {
    draft
        .eligibility
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("encoding eligibility: {e}")))
}
