//! Axum JSON API over the SchemeSeva store: scheme browsing, bookmarks,
//! reminders, profiles and saved notes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use seva_core::{
    evaluation_date, generate, Bookmark, DeadlineStatus, NotificationRecord, SavedNote, Scheme,
    UserProfile,
};
use seva_storage::{SchemeStore, StoreError};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "seva-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SchemeStore>,
    /// Fixed evaluation date; `None` means today in UTC.
    pub today: Option<NaiveDate>,
}

impl AppState {
    pub fn new(store: Arc<dyn SchemeStore>) -> Self {
        Self { store, today: None }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| evaluation_date(Utc::now()))
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Invalid(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownScheme(id) => ApiError::NotFound(format!("scheme {id} not found")),
            StoreError::InvalidProfile(e) => ApiError::Invalid(e.to_string()),
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Invalid(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Store(StoreError::Unavailable(msg)) => {
                tracing::warn!(error = %msg, "store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "store unavailable".to_string())
            }
            ApiError::Store(err) => {
                tracing::error!(error = %err, "store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Serialize)]
pub struct SchemeView {
    #[serde(flatten)]
    pub scheme: Scheme,
    pub deadline_status: Option<DeadlineStatus>,
}

impl SchemeView {
    fn new(scheme: Scheme, today: NaiveDate) -> Self {
        let deadline_status = scheme.deadline_status(today);
        Self {
            scheme,
            deadline_status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemesPage {
    pub schemes: Vec<SchemeView>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchemesQuery {
    q: Option<String>,
    category: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookmarkView {
    pub scheme_id: Uuid,
    pub saved_at: DateTime<Utc>,
    /// `None` when the scheme row has gone missing.
    pub scheme: Option<SchemeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationsView {
    pub evaluated_on: NaiveDate,
    pub notifications: Vec<NotificationRecord>,
    pub skipped_missing: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileInput {
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

#[derive(Debug, Clone, Deserialize)]
pub struct NoteInput {
    pub section_key: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/schemes", get(schemes_handler))
        .route("/schemes/categories", get(categories_handler))
        .route("/users/{user_id}/bookmarks", get(bookmarks_handler))
        .route(
            "/users/{user_id}/bookmarks/{scheme_id}",
            put(add_bookmark_handler).delete(remove_bookmark_handler),
        )
        .route("/users/{user_id}/notifications", get(notifications_handler))
        .route(
            "/users/{user_id}/profile",
            get(get_profile_handler).put(put_profile_handler),
        )
        .route(
            "/users/{user_id}/notes",
            get(list_notes_handler).post(save_note_handler),
        )
        .route(
            "/users/{user_id}/notes/{note_id}",
            axum::routing::delete(delete_note_handler),
        )
        .route("/admin/schemes/{scheme_id}/deactivate", post(deactivate_handler))
        .route("/admin/schemes/{scheme_id}/activate", post(activate_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving SchemeSeva API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

fn matches_query(scheme: &Scheme, needle: &str, category: &str) -> bool {
    let text_ok = needle.is_empty()
        || scheme.name.to_lowercase().contains(needle)
        || scheme
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(needle));
    let category_ok = category.is_empty()
        || scheme
            .category
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(category));
    text_ok && category_ok
}

async fn schemes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SchemesQuery>,
) -> ApiResult<Json<SchemesPage>> {
    let today = state.today();
    let needle = query.q.unwrap_or_default().trim().to_lowercase();
    let category = query.category.unwrap_or_default().trim().to_string();

    let filtered = state
        .store
        .list_active_schemes()
        .await?
        .into_iter()
        .filter(|s| matches_query(s, &needle, &category))
        .collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let schemes = filtered
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|s| SchemeView::new(s, today))
        .collect();

    Ok(Json(SchemesPage {
        schemes,
        page,
        per_page,
        total,
        total_pages,
    }))
}

async fn categories_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<CategoryCount>>> {
    let mut counts = BTreeMap::<String, usize>::new();
    for scheme in state.store.list_active_schemes().await? {
        if let Some(category) = scheme.category {
            *counts.entry(category).or_default() += 1;
        }
    }
    Ok(Json(
        counts
            .into_iter()
            .map(|(category, count)| CategoryCount { category, count })
            .collect(),
    ))
}

async fn bookmarks_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<BookmarkView>>> {
    let today = state.today();
    let views = state
        .store
        .get_bookmarks(user_id)
        .await?
        .into_iter()
        .map(|entry| BookmarkView {
            scheme_id: entry.bookmark.scheme_id,
            saved_at: entry.bookmark.saved_at,
            scheme: entry.scheme.map(|s| SchemeView::new(s, today)),
        })
        .collect();
    Ok(Json(views))
}

async fn add_bookmark_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, scheme_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Bookmark>> {
    Ok(Json(state.store.add_bookmark(user_id, scheme_id).await?))
}

async fn remove_bookmark_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, scheme_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state.store.remove_bookmark(user_id, scheme_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("scheme {scheme_id} is not bookmarked")))
    }
}

async fn notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<NotificationsView>> {
    let today = state.today();
    let bookmarks = state.store.get_bookmarks(user_id).await?;
    let generated = generate(&bookmarks, today);
    Ok(Json(NotificationsView {
        evaluated_on: today,
        notifications: generated.records,
        skipped_missing: generated.skipped_missing,
    }))
}

async fn get_profile_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<UserProfile>> {
    state
        .store
        .get_profile(user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no profile for user {user_id}")))
}

async fn put_profile_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Json(input): Json<ProfileInput>,
) -> ApiResult<Json<UserProfile>> {
    let profile = UserProfile {
        user_id,
        name: input.name.trim().to_string(),
        age: input.age,
        gender: input.gender,
        community_category: input.community_category,
        occupation: input.occupation,
        education: input.education,
        contact_email: input.contact_email.filter(|e| !e.trim().is_empty()),
    };
    state.store.save_profile(profile.clone()).await?;
    Ok(Json(profile))
}

async fn list_notes_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SavedNote>>> {
    Ok(Json(state.store.list_notes(user_id).await?))
}

async fn save_note_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Json(input): Json<NoteInput>,
) -> ApiResult<Json<SavedNote>> {
    let section_key = input.section_key.trim();
    let title = input.title.trim();
    if section_key.is_empty() || title.is_empty() {
        return Err(ApiError::Invalid("section_key and title are required".into()));
    }
    let note = SavedNote::new(user_id, section_key, title, input.body, Utc::now());
    Ok(Json(state.store.save_note(note).await?))
}

async fn delete_note_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, note_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state.store.delete_note(user_id, note_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("note {note_id} not found")))
    }
}

async fn deactivate_handler(
    State(state): State<Arc<AppState>>,
    Path(scheme_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.store.set_scheme_active(scheme_id, false).await?;
    tracing::info!(%scheme_id, "scheme deactivated");
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_handler(
    State(state): State<Arc<AppState>>,
    Path(scheme_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.store.set_scheme_active(scheme_id, true).await?;
    tracing::info!(%scheme_id, "scheme activated");
    Ok(StatusCode::NO_CONTENT)
}
