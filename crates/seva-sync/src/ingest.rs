//! Validation and upsert of scraped scheme records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use seva_core::{normalize_key_fragment, RawSchemeData, SchemeDraft, SchemeKey};
use seva_storage::{SchemeStore, StoreError, UpsertKind};
use strsim::jaro_winkler;
use thiserror::Error;
use url::Url;

pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.93;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("name is empty")]
    EmptyName,
    #[error("source url {0:?} is not an absolute http(s) url")]
    InvalidSourceUrl(String),
    #[error("deadline {0:?} is not a YYYY-MM-DD date")]
    InvalidDeadline(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Position of the record in the submitted batch.
    pub index: usize,
    pub name: String,
    pub reason: RejectReason,
}

/// Two accepted schemes from the same page whose names are suspiciously close.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub source_url: String,
    pub name_a: String,
    pub name_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestResult {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub rejected: Vec<Rejection>,
    pub duplicates_in_batch: usize,
    pub review: Vec<ReviewItem>,
}

impl IngestResult {
    pub fn ingested(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} of {} schemes ingested ({} new, {} updated)",
            self.ingested(),
            self.received,
            self.inserted,
            self.updated
        );
        if self.duplicates_in_batch > 0 {
            line.push_str(&format!(", {} duplicate(s) merged", self.duplicates_in_batch));
        }
        if !self.rejected.is_empty() {
            let shown = self
                .rejected
                .iter()
                .take(3)
                .map(|r| format!("#{} {:?}: {}", r.index, r.name, r.reason))
                .collect::<Vec<_>>()
                .join("; ");
            line.push_str(&format!(", {} rejected: {shown}", self.rejected.len()));
            if self.rejected.len() > 3 {
                line.push_str(&format!(" and {} more", self.rejected.len() - 3));
            }
        }
        line
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("scheme store failed during ingest: {0}")]
    Store(#[from] StoreError),
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn validate(raw: RawSchemeData) -> Result<SchemeDraft, RejectReason> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(RejectReason::EmptyName);
    }

    let source_url = raw.source_url.trim().to_string();
    let url_ok = Url::parse(&source_url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false);
    if !url_ok {
        return Err(RejectReason::InvalidSourceUrl(raw.source_url));
    }

    let deadline = match clean(raw.deadline) {
        None => None,
        Some(text) => Some(
            NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map_err(|_| RejectReason::InvalidDeadline(text.clone()))?,
        ),
    };

    Ok(SchemeDraft {
        name,
        description: clean(raw.description),
        category: clean(raw.category),
        eligibility: raw.eligibility_criteria.filter(|e| !e.is_blank()),
        deadline,
        source_url,
    })
}

pub struct IngestPipeline {
    store: Arc<dyn SchemeStore>,
    review_threshold: f64,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn SchemeStore>) -> Self {
        Self {
            store,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
        }
    }

    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_threshold = threshold;
        self
    }

    /// Validates, deduplicates and upserts one batch. Bad records are
    /// reported in the result; only a store failure aborts, and then nothing
    /// from the batch is written.
    pub async fn ingest(&self, raw: Vec<RawSchemeData>) -> Result<IngestResult, IngestError> {
        let mut result = IngestResult {
            received: raw.len(),
            ..Default::default()
        };

        let mut drafts: Vec<SchemeDraft> = Vec::new();
        let mut positions: HashMap<SchemeKey, usize> = HashMap::new();
        for (index, record) in raw.into_iter().enumerate() {
            let name = record.name.trim().to_string();
            match validate(record) {
                Ok(draft) => match positions.get(&draft.key()) {
                    Some(&pos) => {
                        drafts[pos] = draft;
                        result.duplicates_in_batch += 1;
                    }
                    None => {
                        positions.insert(draft.key(), drafts.len());
                        drafts.push(draft);
                    }
                },
                Err(reason) => {
                    tracing::warn!(index, name = %name, %reason, "rejected scheme record");
                    result.rejected.push(Rejection { index, name, reason });
                }
            }
        }

        result.review = self.review_pairs(&drafts);
        for item in &result.review {
            tracing::warn!(
                source_url = %item.source_url,
                name_a = %item.name_a,
                name_b = %item.name_b,
                score = item.score,
                "possible duplicate schemes"
            );
        }

        if !drafts.is_empty() {
            for outcome in self.store.upsert_schemes(drafts).await? {
                match outcome.kind {
                    UpsertKind::Inserted => result.inserted += 1,
                    UpsertKind::Updated => result.updated += 1,
                }
            }
        }
        Ok(result)
    }

    fn review_pairs(&self, drafts: &[SchemeDraft]) -> Vec<ReviewItem> {
        let keys: Vec<SchemeKey> = drafts.iter().map(SchemeDraft::key).collect();
        let mut items = Vec::new();
        for i in 0..drafts.len() {
            for j in (i + 1)..drafts.len() {
                if keys[i].source_url != keys[j].source_url || keys[i].name == keys[j].name {
                    continue;
                }
                let score = jaro_winkler(
                    &normalize_key_fragment(&drafts[i].name),
                    &normalize_key_fragment(&drafts[j].name),
                );
                if score >= self.review_threshold {
                    items.push(ReviewItem {
                        source_url: keys[i].source_url.clone(),
                        name_a: drafts[i].name.clone(),
                        name_b: drafts[j].name.clone(),
                        score,
                    });
                }
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use seva_core::Eligibility;
    use seva_storage::MemoryStore;

    use super::*;

    fn raw(name: &str, url: &str, deadline: Option<&str>) -> RawSchemeData {
        RawSchemeData {
            name: name.into(),
            description: Some("  Support for farmers ".into()),
            category: Some("Agriculture".into()),
            eligibility_criteria: Some(Eligibility::Text("Small and marginal farmers".into())),
            deadline: deadline.map(str::to_string),
            source_url: url.into(),
        }
    }

    fn pipeline() -> (Arc<MemoryStore>, IngestPipeline) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone());
        (store, pipeline)
    }

    #[test]
    fn validation_rules() {
        assert_eq!(
            validate(raw("   ", "https://pmkisan.gov.in", None)),
            Err(RejectReason::EmptyName)
        );
        assert!(matches!(
            validate(raw("PM Kisan", "pmkisan.gov.in", None)),
            Err(RejectReason::InvalidSourceUrl(_))
        ));
        assert!(matches!(
            validate(raw("PM Kisan", "ftp://pmkisan.gov.in", None)),
            Err(RejectReason::InvalidSourceUrl(_))
        ));
        assert_eq!(
            validate(raw("PM Kisan", "https://pmkisan.gov.in", Some("31/12/2026"))),
            Err(RejectReason::InvalidDeadline("31/12/2026".into()))
        );

        let draft = validate(raw(" PM Kisan ", "https://pmkisan.gov.in", Some("  "))).unwrap();
        assert_eq!(draft.name, "PM Kisan");
        assert_eq!(draft.deadline, None);
        assert_eq!(draft.description.as_deref(), Some("Support for farmers"));
    }

    #[tokio::test]
    async fn empty_name_is_rejected_and_rest_ingested() {
        let (store, pipeline) = pipeline();
        let result = pipeline
            .ingest(vec![
                raw("PM Kisan Samman Nidhi", "https://pmkisan.gov.in", Some("2026-12-31")),
                raw("", "https://pmaymis.gov.in", Some("2026-11-30")),
            ])
            .await
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].index, 1);
        assert_eq!(result.rejected[0].reason, RejectReason::EmptyName);
        assert_eq!(store.scheme_count().await, 1);
        assert_eq!(
            result.summary(),
            "1 of 2 schemes ingested (1 new, 0 updated), 1 rejected: #1 \"\": name is empty"
        );
    }

    #[tokio::test]
    async fn reingest_with_new_deadline_updates_in_place() {
        let (store, pipeline) = pipeline();
        pipeline
            .ingest(vec![raw("PM Kisan", "https://pmkisan.gov.in", Some("2026-12-31"))])
            .await
            .unwrap();
        let second = pipeline
            .ingest(vec![raw("pm  kisan", "https://pmkisan.gov.in/", Some("2027-01-31"))])
            .await
            .unwrap();
        assert_eq!((second.inserted, second.updated), (0, 1));

        let schemes = store.list_active_schemes().await.unwrap();
        assert_eq!(schemes.len(), 1);
        assert_eq!(schemes[0].deadline, NaiveDate::from_ymd_opt(2027, 1, 31));
        assert_eq!(schemes[0].name, "PM Kisan");
    }

    #[tokio::test]
    async fn last_duplicate_in_batch_wins() {
        let (store, pipeline) = pipeline();
        let result = pipeline
            .ingest(vec![
                raw("Digital India", "https://digitalindia.gov.in", Some("2026-11-01")),
                raw("Digital India", "https://digitalindia.gov.in", Some("2026-11-15")),
            ])
            .await
            .unwrap();
        assert_eq!(result.duplicates_in_batch, 1);
        assert_eq!(result.inserted, 1);
        let schemes = store.list_active_schemes().await.unwrap();
        assert_eq!(schemes[0].deadline, NaiveDate::from_ymd_opt(2026, 11, 15));
    }

    #[tokio::test]
    async fn deactivated_scheme_stays_inactive_after_reingest() {
        let (store, pipeline) = pipeline();
        pipeline
            .ingest(vec![raw("PM Kisan", "https://pmkisan.gov.in", None)])
            .await
            .unwrap();
        let id = SchemeKey::new("PM Kisan", "https://pmkisan.gov.in").scheme_id();
        store.set_scheme_active(id, false).await.unwrap();

        pipeline
            .ingest(vec![raw("PM Kisan", "https://pmkisan.gov.in", Some("2026-12-31"))])
            .await
            .unwrap();
        let scheme = store.get_scheme(id).await.unwrap().unwrap();
        assert!(!scheme.is_active);
        assert_eq!(scheme.deadline, NaiveDate::from_ymd_opt(2026, 12, 31));
    }

    #[tokio::test]
    async fn near_duplicates_are_reported_not_merged() {
        let (store, pipeline) = pipeline();
        let result = pipeline
            .ingest(vec![
                raw("Pradhan Mantri Awas Yojana Gramin", "https://pmayg.nic.in", None),
                raw("Pradhan Mantri Awas Yojana - Gramin.", "https://pmayg.nic.in", None),
                raw("Pradhan Mantri Awas Yojana Urban", "https://pmaymis.gov.in", None),
            ])
            .await
            .unwrap();
        // The first two normalize to the same key and merge outright.
        assert_eq!(result.duplicates_in_batch, 1);

        let result = pipeline
            .ingest(vec![
                raw("Stand Up India Scheme", "https://standupmitra.in", None),
                raw("Stand Up India Schemes", "https://standupmitra.in", None),
            ])
            .await
            .unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.review.len(), 1);
        assert!(result.review[0].score >= DEFAULT_REVIEW_THRESHOLD);
        assert_eq!(store.scheme_count().await, 4);
    }

    #[tokio::test]
    async fn store_outage_is_fatal_and_writes_nothing() {
        let (store, pipeline) = pipeline();
        store.set_unavailable(true);
        let err = pipeline
            .ingest(vec![raw("PM Kisan", "https://pmkisan.gov.in", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert_eq!(store.scheme_count().await, 0);
    }

    #[tokio::test]
    async fn all_rejected_batch_never_touches_store() {
        let (store, pipeline) = pipeline();
        store.set_unavailable(true);
        let result = pipeline
            .ingest(vec![raw("", "https://pmkisan.gov.in", None)])
            .await
            .unwrap();
        assert_eq!(result.ingested(), 0);
        assert_eq!(result.rejected.len(), 1);
    }

    #[tokio::test]
    async fn feed_with_null_fields_keeps_valid_records() {
        let (store, pipeline) = pipeline();
        let records = seva_adapters::parse_feed(
            br#"[
                {"name": "Digital India", "source_url": "https://digitalindia.gov.in"},
                {"name": null, "source_url": "https://pmaymis.gov.in", "deadline": "2026-11-30"},
                {"name": "Stand Up India", "source_url": null}
            ]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 3);

        let result = pipeline.ingest(records).await.unwrap();
        assert_eq!(result.inserted, 1);
        let reasons: Vec<_> = result.rejected.iter().map(|r| (r.index, r.reason.clone())).collect();
        assert_eq!(
            reasons,
            vec![
                (1, RejectReason::EmptyName),
                (2, RejectReason::InvalidSourceUrl(String::new())),
            ]
        );
        assert_eq!(store.scheme_count().await, 1);
    }

    #[tokio::test]
    async fn stricter_review_threshold_drops_review_items() {
        let (_, pipeline) = pipeline();
        let pipeline = pipeline.with_review_threshold(0.999);
        let result = pipeline
            .ingest(vec![
                raw("Stand Up India Scheme", "https://standupmitra.in", None),
                raw("Stand Up India Schemes", "https://standupmitra.in", None),
            ])
            .await
            .unwrap();
        assert_eq!(result.inserted, 2);
        assert!(result.review.is_empty());
    }
}
