//! Postgres-backed store over the hosted SchemeSeva schema.
//!
//! Tables are owned by the hosting platform and expected to exist:
//! `schemes`, `saved_schemes`, `profiles`, `saved_notes` and
//! `notification_watermarks`.
//!
//! Scheme upserts match existing rows on the normalized (name, source URL)
//! key, not on `id`: rows written by other tools keep whatever id they were
//! given. Normalization in SQL mirrors [`seva_core::SchemeKey`] (lowercase,
//! non-alphanumeric runs collapsed to one space, trailing `/` dropped from the
//! URL); non-ASCII letters depend on the database locale. An expression index
//! on both normalized columns keeps the lookup cheap.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use seva_core::{
    Bookmark, BookmarkedScheme, Eligibility, NotificationWatermark, SavedNote, Scheme,
    SchemeDraft, UrgencyBucket, UserProfile,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{eligibility_to_json, SchemeStore, StoreError, UpsertKind, UpsertOutcome};

const SCHEME_COLUMNS: &str = "id, name, description, category, eligibility_criteria, deadline, \
                              source_url, is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

}

fn scheme_from_row(row: &PgRow) -> Result<Scheme, StoreError> {
    let eligibility: Option<JsonValue> = row.try_get("eligibility_criteria")?;
    let eligibility = eligibility
        .filter(|v| !v.is_null())
        .map(serde_json::from_value::<Eligibility>)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("eligibility_criteria: {e}")))?;
    Ok(Scheme {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        eligibility,
        deadline: row.try_get::<Option<NaiveDate>, _>("deadline")?,
        source_url: row.try_get("source_url")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn note_from_row(row: &PgRow) -> Result<SavedNote, StoreError> {
    Ok(SavedNote {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        section_key: row.try_get("section_key")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        saved_at: row.try_get("saved_at")?,
    })
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

const EXISTING_BY_KEY_SQL: &str = r#"
    SELECT id
      FROM schemes
     WHERE btrim(regexp_replace(lower(name), '[^[:alnum:]]+', ' ', 'g')) = $1
       AND rtrim(btrim(source_url), '/') = $2
     ORDER BY created_at ASC, id ASC
     LIMIT 1
     FOR UPDATE
"#;

async fn upsert_in(
    tx: &mut Transaction<'_, Postgres>,
    draft: SchemeDraft,
) -> Result<UpsertOutcome, StoreError> {
    let key = draft.key();
    let eligibility = eligibility_to_json(&draft)?;

    let existing = sqlx::query(EXISTING_BY_KEY_SQL)
        .bind(&key.name)
        .bind(&key.source_url)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = existing {
        let scheme_id: Uuid = row.try_get("id")?;
        sqlx::query(
            r#"
            UPDATE schemes
               SET description = $2,
                   category = $3,
                   eligibility_criteria = $4,
                   deadline = $5,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(scheme_id)
        .bind(&draft.description)
        .bind(&draft.category)
        .bind(eligibility)
        .bind(draft.deadline)
        .execute(&mut **tx)
        .await?;
        return Ok(UpsertOutcome {
            scheme_id,
            kind: UpsertKind::Updated,
        });
    }

    let scheme_id = key.scheme_id();
    // A concurrent ingest may insert the same key first; xmax is zero only
    // for freshly inserted tuples.
    let row = sqlx::query(
        r#"
        INSERT INTO schemes
            (id, name, description, category, eligibility_criteria, deadline, source_url,
             is_active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, NOW(), NOW())
        ON CONFLICT (id) DO UPDATE
        SET description = EXCLUDED.description,
            category = EXCLUDED.category,
            eligibility_criteria = EXCLUDED.eligibility_criteria,
            deadline = EXCLUDED.deadline,
            updated_at = NOW()
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .bind(scheme_id)
    .bind(&draft.name)
    .bind(&draft.description)
    .bind(&draft.category)
    .bind(eligibility)
    .bind(draft.deadline)
    .bind(&draft.source_url)
    .fetch_one(&mut **tx)
    .await?;

    let inserted: bool = row.try_get("inserted")?;
    Ok(UpsertOutcome {
        scheme_id,
        kind: if inserted {
            UpsertKind::Inserted
        } else {
            UpsertKind::Updated
        },
    })
}

#[async_trait]
impl SchemeStore for PgStore {
    async fn list_active_schemes(&self) -> Result<Vec<Scheme>, StoreError> {
        let sql = format!(
            "SELECT {SCHEME_COLUMNS} FROM schemes WHERE is_active \
             ORDER BY deadline ASC NULLS LAST, name ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(scheme_from_row).collect()
    }

    async fn get_scheme(&self, scheme_id: Uuid) -> Result<Option<Scheme>, StoreError> {
        let sql = format!("SELECT {SCHEME_COLUMNS} FROM schemes WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(scheme_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scheme_from_row).transpose()
    }

    async fn upsert_scheme(&self, draft: SchemeDraft) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_in(&mut tx, draft).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn upsert_schemes(
        &self,
        drafts: Vec<SchemeDraft>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(drafts.len());
        for draft in drafts {
            outcomes.push(upsert_in(&mut tx, draft).await?);
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn set_scheme_active(&self, scheme_id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE schemes SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(scheme_id)
        .bind(active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownScheme(scheme_id));
        }
        Ok(())
    }

    async fn get_bookmarks(&self, user_id: Uuid) -> Result<Vec<BookmarkedScheme>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT b.user_id, b.scheme_id, b.saved_at,
                   s.id, s.name, s.description, s.category, s.eligibility_criteria,
                   s.deadline, s.source_url, s.is_active, s.created_at, s.updated_at,
                   (s.id IS NOT NULL) AS has_scheme
              FROM saved_schemes b
              LEFT JOIN schemes s ON s.id = b.scheme_id
             WHERE b.user_id = $1
             ORDER BY b.saved_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let has_scheme: bool = row.try_get("has_scheme")?;
            out.push(BookmarkedScheme {
                bookmark: Bookmark {
                    user_id: row.try_get("user_id")?,
                    scheme_id: row.try_get("scheme_id")?,
                    saved_at: row.try_get("saved_at")?,
                },
                scheme: if has_scheme {
                    Some(scheme_from_row(&row)?)
                } else {
                    None
                },
            });
        }
        Ok(out)
    }

    async fn add_bookmark(&self, user_id: Uuid, scheme_id: Uuid) -> Result<Bookmark, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO saved_schemes (user_id, scheme_id, saved_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id, scheme_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(scheme_id)
        .execute(&self.pool)
        .await;
        if let Err(err) = inserted {
            if is_foreign_key_violation(&err) {
                return Err(StoreError::UnknownScheme(scheme_id));
            }
            return Err(err.into());
        }

        let row = sqlx::query(
            "SELECT saved_at FROM saved_schemes WHERE user_id = $1 AND scheme_id = $2",
        )
        .bind(user_id)
        .bind(scheme_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Bookmark {
            user_id,
            scheme_id,
            saved_at: row.try_get::<DateTime<Utc>, _>("saved_at")?,
        })
    }

    async fn remove_bookmark(&self, user_id: Uuid, scheme_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM saved_schemes WHERE user_id = $1 AND scheme_id = $2")
            .bind(user_id)
            .bind(scheme_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_bookmark_owners(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM saved_schemes ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, name, age, gender, caste_community, occupation, education,
                   contact_email
              FROM profiles
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let age: i32 = row.try_get("age")?;
        Ok(Some(UserProfile {
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            age: u32::try_from(age)
                .map_err(|_| StoreError::Corrupt(format!("profile {user_id} has age {age}")))?,
            gender: row.try_get("gender")?,
            community_category: row.try_get("caste_community")?,
            occupation: row.try_get("occupation")?,
            education: row.try_get("education")?,
            contact_email: row.try_get("contact_email")?,
        }))
    }

    async fn save_profile(&self, profile: UserProfile) -> Result<(), StoreError> {
        profile.validate()?;
        let age = i32::try_from(profile.age)
            .map_err(|_| StoreError::Corrupt(format!("age {} out of range", profile.age)))?;
        sqlx::query(
            r#"
            INSERT INTO profiles
                (user_id, name, age, gender, caste_community, occupation, education, contact_email)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE
            SET name = EXCLUDED.name,
                age = EXCLUDED.age,
                gender = EXCLUDED.gender,
                caste_community = EXCLUDED.caste_community,
                occupation = EXCLUDED.occupation,
                education = EXCLUDED.education,
                contact_email = EXCLUDED.contact_email
            "#,
        )
        .bind(profile.user_id)
        .bind(&profile.name)
        .bind(age)
        .bind(&profile.gender)
        .bind(&profile.community_category)
        .bind(&profile.occupation)
        .bind(&profile.education)
        .bind(&profile.contact_email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_note(&self, note: SavedNote) -> Result<SavedNote, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO saved_notes (id, user_id, section_key, title, body, saved_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, section_key) DO UPDATE
            SET title = EXCLUDED.title,
                body = EXCLUDED.body,
                saved_at = EXCLUDED.saved_at
            RETURNING id, user_id, section_key, title, body, saved_at
            "#,
        )
        .bind(note.id)
        .bind(note.user_id)
        .bind(&note.section_key)
        .bind(&note.title)
        .bind(&note.body)
        .bind(note.saved_at)
        .fetch_one(&self.pool)
        .await?;
        note_from_row(&row)
    }

    async fn list_notes(&self, user_id: Uuid) -> Result<Vec<SavedNote>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, section_key, title, body, saved_at
              FROM saved_notes
             WHERE user_id = $1
             ORDER BY saved_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(note_from_row).collect()
    }

    async fn delete_note(&self, user_id: Uuid, note_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM saved_notes WHERE id = $1 AND user_id = $2")
            .bind(note_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn last_notified(
        &self,
        user_id: Uuid,
        scheme_id: Uuid,
    ) -> Result<Option<NotificationWatermark>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT bucket, notified_at
              FROM notification_watermarks
             WHERE user_id = $1 AND scheme_id = $2
            "#,
        )
        .bind(user_id)
        .bind(scheme_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let bucket: String = row.try_get("bucket")?;
        Ok(Some(NotificationWatermark {
            user_id,
            scheme_id,
            bucket: UrgencyBucket::parse(&bucket)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown bucket {bucket:?}")))?,
            notified_at: row.try_get("notified_at")?,
        }))
    }

    async fn record_notified(&self, watermark: NotificationWatermark) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_watermarks (user_id, scheme_id, bucket, notified_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, scheme_id) DO UPDATE
            SET bucket = EXCLUDED.bucket,
                notified_at = EXCLUDED.notified_at
            "#,
        )
        .bind(watermark.user_id)
        .bind(watermark.scheme_id)
        .bind(watermark.bucket.as_str())
        .bind(watermark.notified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-connection pool so the temp table is visible to every query.
    /// Skipped unless `SEVA_TEST_DATABASE_URL` points at a scratch database.
    async fn scratch_store() -> Option<(PgPool, PgStore)> {
        let url = std::env::var("SEVA_TEST_DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TEMP TABLE schemes (
                id uuid PRIMARY KEY,
                name text NOT NULL,
                description text,
                category text,
                eligibility_criteria jsonb,
                deadline date,
                source_url text NOT NULL,
                is_active boolean NOT NULL DEFAULT TRUE,
                created_at timestamptz NOT NULL DEFAULT NOW(),
                updated_at timestamptz NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        Some((pool.clone(), PgStore::new(pool)))
    }

    fn draft(name: &str, url: &str, deadline: Option<NaiveDate>) -> SchemeDraft {
        SchemeDraft {
            name: name.into(),
            description: Some("Income support".into()),
            category: Some("Agriculture".into()),
            eligibility: Some(Eligibility::Text("Landholding farmers".into())),
            deadline,
            source_url: url.into(),
        }
    }

    #[tokio::test]
    async fn upsert_matches_rows_not_created_by_ingest() {
        let Some((pool, store)) = scratch_store().await else {
            return;
        };
        let legacy_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO schemes (id, name, source_url, is_active) VALUES ($1, $2, $3, FALSE)",
        )
        .bind(legacy_id)
        .bind("PM Kisan Samman Nidhi")
        .bind("https://pmkisan.gov.in")
        .execute(&pool)
        .await
        .unwrap();

        let outcome = store
            .upsert_scheme(draft(
                "pm kisan  samman-nidhi",
                "https://pmkisan.gov.in/",
                NaiveDate::from_ymd_opt(2026, 12, 31),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.kind, UpsertKind::Updated);
        assert_eq!(outcome.scheme_id, legacy_id);

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM schemes")
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count, 1);

        let scheme = store.get_scheme(legacy_id).await.unwrap().unwrap();
        assert_eq!(scheme.name, "PM Kisan Samman Nidhi");
        assert_eq!(scheme.deadline, NaiveDate::from_ymd_opt(2026, 12, 31));
        assert!(!scheme.is_active);
    }

    #[tokio::test]
    async fn batch_upsert_inserts_then_updates() {
        let Some((_, store)) = scratch_store().await else {
            return;
        };
        let first = store
            .upsert_schemes(vec![
                draft("Digital India", "https://digitalindia.gov.in", None),
                draft("Stand Up India", "https://standupmitra.in", None),
            ])
            .await
            .unwrap();
        assert!(first.iter().all(|o| o.kind == UpsertKind::Inserted));

        let second = store
            .upsert_schemes(vec![draft("DIGITAL INDIA", "https://digitalindia.gov.in", None)])
            .await
            .unwrap();
        assert_eq!(second[0].kind, UpsertKind::Updated);
        assert_eq!(second[0].scheme_id, first[0].scheme_id);
        assert_eq!(store.list_active_schemes().await.unwrap().len(), 2);
    }
}
