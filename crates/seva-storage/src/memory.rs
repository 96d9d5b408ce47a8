//! In-process store used by tests, dry runs and deployments without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use seva_core::{
    Bookmark, BookmarkedScheme, NotificationWatermark, SavedNote, Scheme, SchemeDraft,
    UserProfile,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{SchemeStore, StoreError, UpsertKind, UpsertOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    schemes: BTreeMap<Uuid, Scheme>,
    bookmarks: BTreeMap<(Uuid, Uuid), Bookmark>,
    profiles: HashMap<Uuid, UserProfile>,
    notes: BTreeMap<Uuid, SavedNote>,
    watermarks: HashMap<(Uuid, Uuid), NotificationWatermark>,
}

impl MemoryState {
    fn upsert(&mut self, draft: SchemeDraft) -> UpsertOutcome {
        let now = Utc::now();
        let scheme_id = draft.key().scheme_id();
        match self.schemes.get_mut(&scheme_id) {
            Some(existing) => {
                existing.apply_draft(draft, now);
                UpsertOutcome {
                    scheme_id,
                    kind: UpsertKind::Updated,
                }
            }
            None => {
                self.schemes.insert(scheme_id, draft.into_scheme(now));
                UpsertOutcome {
                    scheme_id,
                    kind: UpsertKind::Inserted,
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    pub async fn scheme_count(&self) -> usize {
        self.state.read().await.schemes.len()
    }
}

#[async_trait]
impl SchemeStore for MemoryStore {
    async fn list_active_schemes(&self) -> Result<Vec<Scheme>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut schemes = state
            .schemes
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect::<Vec<_>>();
        schemes.sort_by(|a, b| match (a.deadline, b.deadline) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        });
        Ok(schemes)
    }

    async fn get_scheme(&self, scheme_id: Uuid) -> Result<Option<Scheme>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.schemes.get(&scheme_id).cloned())
    }

    async fn upsert_scheme(&self, draft: SchemeDraft) -> Result<UpsertOutcome, StoreError> {
        self.check()?;
        Ok(self.state.write().await.upsert(draft))
    }

    async fn upsert_schemes(
        &self,
        drafts: Vec<SchemeDraft>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        Ok(drafts.into_iter().map(|draft| state.upsert(draft)).collect())
    }

    async fn set_scheme_active(&self, scheme_id: Uuid, active: bool) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let scheme = state
            .schemes
            .get_mut(&scheme_id)
            .ok_or(StoreError::UnknownScheme(scheme_id))?;
        scheme.is_active = active;
        scheme.updated_at = Utc::now();
        Ok(())
    }

    async fn get_bookmarks(&self, user_id: Uuid) -> Result<Vec<BookmarkedScheme>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut out = state
            .bookmarks
            .range((user_id, Uuid::nil())..=(user_id, Uuid::from_u128(u128::MAX)))
            .map(|(_, bookmark)| BookmarkedScheme {
                bookmark: bookmark.clone(),
                scheme: state.schemes.get(&bookmark.scheme_id).cloned(),
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.bookmark.saved_at.cmp(&a.bookmark.saved_at));
        Ok(out)
    }

    async fn add_bookmark(&self, user_id: Uuid, scheme_id: Uuid) -> Result<Bookmark, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        if !state.schemes.contains_key(&scheme_id) {
            return Err(StoreError::UnknownScheme(scheme_id));
        }
        let bookmark = state
            .bookmarks
            .entry((user_id, scheme_id))
            .or_insert_with(|| Bookmark {
                user_id,
                scheme_id,
                saved_at: Utc::now(),
            });
        Ok(bookmark.clone())
    }

    async fn remove_bookmark(&self, user_id: Uuid, scheme_id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .state
            .write()
            .await
            .bookmarks
            .remove(&(user_id, scheme_id))
            .is_some())
    }

    async fn list_bookmark_owners(&self) -> Result<Vec<Uuid>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let owners = state
            .bookmarks
            .keys()
            .map(|(user_id, _)| *user_id)
            .collect::<BTreeSet<_>>();
        Ok(owners.into_iter().collect())
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.profiles.get(&user_id).cloned())
    }

    async fn save_profile(&self, profile: UserProfile) -> Result<(), StoreError> {
        self.check()?;
        profile.validate()?;
        self.state
            .write()
            .await
            .profiles
            .insert(profile.user_id, profile);
        Ok(())
    }

    async fn save_note(&self, note: SavedNote) -> Result<SavedNote, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let existing = state
            .notes
            .values()
            .find(|n| n.user_id == note.user_id && n.section_key == note.section_key)
            .map(|n| n.id);
        if let Some(current) = existing.and_then(|id| state.notes.get_mut(&id)) {
            current.title = note.title;
            current.body = note.body;
            current.saved_at = note.saved_at;
            return Ok(current.clone());
        }
        state.notes.insert(note.id, note.clone());
        Ok(note)
    }

    async fn list_notes(&self, user_id: Uuid) -> Result<Vec<SavedNote>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut notes = state
            .notes
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        notes.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(notes)
    }

    async fn delete_note(&self, user_id: Uuid, note_id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let owned = state
            .notes
            .get(&note_id)
            .map(|n| n.user_id == user_id)
            .unwrap_or(false);
        if owned {
            state.notes.remove(&note_id);
        }
        Ok(owned)
    }

    async fn last_notified(
        &self,
        user_id: Uuid,
        scheme_id: Uuid,
    ) -> Result<Option<NotificationWatermark>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .watermarks
            .get(&(user_id, scheme_id))
            .cloned())
    }

    async fn record_notified(&self, watermark: NotificationWatermark) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .watermarks
            .insert((watermark.user_id, watermark.scheme_id), watermark);
        Ok(())
    }
}
