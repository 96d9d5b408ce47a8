//! Daily reminder pass: generate, suppress repeats, dispatch, remember.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use seva_core::{evaluation_date, generate, NotificationRecord, NotificationWatermark};
use seva_notify::{DeliveryStatus, DispatchError, DispatchResult, Dispatcher};
use seva_storage::{SchemeStore, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReminderSummary {
    pub evaluated_on: Option<NaiveDate>,
    pub users: usize,
    pub generated: usize,
    pub suppressed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_missing: usize,
    /// Sent reminders whose watermark could not be stored.
    pub watermark_errors: usize,
    pub results: Vec<DispatchResult>,
}

pub struct ReminderRun {
    store: Arc<dyn SchemeStore>,
    dispatcher: Dispatcher,
    record_watermarks: bool,
}

impl ReminderRun {
    pub fn new(store: Arc<dyn SchemeStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            record_watermarks: true,
        }
    }

    /// A dry run still honours existing watermarks but never writes new ones.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.record_watermarks = !dry_run;
        self
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReminderSummary, ReminderError> {
        let today = evaluation_date(now);
        let mut summary = ReminderSummary {
            evaluated_on: Some(today),
            ..Default::default()
        };

        let mut pending: Vec<NotificationRecord> = Vec::new();
        for user_id in self.store.list_bookmark_owners().await? {
            summary.users += 1;
            let bookmarks = self.store.get_bookmarks(user_id).await?;
            let generated = generate(&bookmarks, today);
            summary.generated += generated.records.len();
            summary.skipped_missing += generated.skipped_missing;

            for record in generated.records {
                let previous = self
                    .store
                    .last_notified(record.user_id, record.scheme_id)
                    .await?;
                if previous.is_some_and(|w| w.bucket == record.bucket) {
                    summary.suppressed += 1;
                    continue;
                }
                pending.push(record);
            }
        }

        let results = self.dispatcher.dispatch(pending).await?;
        for result in &results {
            match result.status {
                DeliveryStatus::Sent => {
                    summary.sent += 1;
                    if !self.record_watermarks {
                        continue;
                    }
                    let watermark = NotificationWatermark {
                        user_id: result.record.user_id,
                        scheme_id: result.record.scheme_id,
                        bucket: result.record.bucket,
                        notified_at: now,
                    };
                    // The message is already out; a lost watermark only means a repeat next run.
                    if let Err(err) = self.store.record_notified(watermark).await {
                        summary.watermark_errors += 1;
                        tracing::warn!(
                            user_id = %result.record.user_id,
                            scheme_id = %result.record.scheme_id,
                            error = %err,
                            "failed to record reminder watermark"
                        );
                    }
                }
                DeliveryStatus::Failed => summary.failed += 1,
            }
        }
        summary.results = results;

        tracing::info!(
            evaluated_on = %today,
            channel = self.dispatcher.channel_name(),
            users = summary.users,
            generated = summary.generated,
            suppressed = summary.suppressed,
            sent = summary.sent,
            failed = summary.failed,
            skipped_missing = summary.skipped_missing,
            watermark_errors = summary.watermark_errors,
            "reminder pass finished"
        );
        if summary.failed > 0 {
            tracing::warn!(failed = summary.failed, "some reminders were not delivered");
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use seva_core::{SchemeDraft, UrgencyBucket};
    use seva_notify::{
        ChannelError, DispatchConfig, LogChannel, NotificationChannel, StaticDirectory,
    };
    use seva_storage::MemoryStore;
    use uuid::Uuid;

    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
    }

    async fn seed(store: &MemoryStore, user: Uuid, name: &str, deadline: NaiveDate) -> Uuid {
        let outcome = store
            .upsert_scheme(SchemeDraft {
                name: name.into(),
                description: None,
                category: None,
                eligibility: None,
                deadline: Some(deadline),
                source_url: format!("https://{}.gov.in", name.to_lowercase()),
            })
            .await
            .unwrap();
        store.add_bookmark(user, outcome.scheme_id).await.unwrap();
        outcome.scheme_id
    }

    struct FailFor(HashSet<String>);

    #[async_trait]
    impl NotificationChannel for FailFor {
        fn name(&self) -> &str {
            "fail-for"
        }
        async fn ready(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, _to: &str, subject: &str, _body: &str) -> Result<(), ChannelError> {
            if self.0.iter().any(|n| subject.contains(n.as_str())) {
                Err(ChannelError::Unavailable("relay refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn run_with(
        store: Arc<MemoryStore>,
        channel: Arc<dyn NotificationChannel>,
        user: Uuid,
    ) -> ReminderRun {
        let directory = StaticDirectory::default().with(user, "asha@example.in");
        let dispatcher = Dispatcher::new(channel, Arc::new(directory), DispatchConfig::default());
        ReminderRun::new(store, dispatcher)
    }

    #[tokio::test]
    async fn repeat_runs_are_suppressed_until_bucket_changes() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let scheme = seed(&store, user, "Kisan", NaiveDate::from_ymd_opt(2026, 11, 10).unwrap()).await;
        seed(&store, user, "Faraway", NaiveDate::from_ymd_opt(2027, 6, 1).unwrap()).await;

        let channel = Arc::new(LogChannel::new());
        let run = run_with(store.clone(), channel.clone(), user);

        // 24 days out: WARNING.
        let first = run.run_once(at(2026, 10, 17)).await.unwrap();
        assert_eq!((first.users, first.generated, first.sent), (1, 1, 1));
        let mark = store.last_notified(user, scheme).await.unwrap().unwrap();
        assert_eq!(mark.bucket, UrgencyBucket::Warning);

        let second = run.run_once(at(2026, 10, 18)).await.unwrap();
        assert_eq!((second.generated, second.suppressed, second.sent), (1, 1, 0));

        // 5 days out: CRITICAL, so the user hears about it again.
        let third = run.run_once(at(2026, 11, 5)).await.unwrap();
        assert_eq!((third.suppressed, third.sent), (0, 1));
        assert_eq!(channel.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_deliveries_are_retried_next_run() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let kisan = seed(&store, user, "Kisan", NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()).await;
        let awas = seed(&store, user, "Awas", NaiveDate::from_ymd_opt(2026, 10, 21).unwrap()).await;

        let channel = Arc::new(FailFor(HashSet::from(["Awas".to_string()])));
        let run = run_with(store.clone(), channel, user);
        let summary = run.run_once(at(2026, 10, 17)).await.unwrap();
        assert_eq!((summary.sent, summary.failed), (1, 1));
        assert!(store.last_notified(user, kisan).await.unwrap().is_some());
        assert!(store.last_notified(user, awas).await.unwrap().is_none());

        let retry = run_with(store.clone(), Arc::new(LogChannel::new()), user);
        let summary = retry.run_once(at(2026, 10, 17)).await.unwrap();
        assert_eq!((summary.suppressed, summary.sent), (1, 1));
    }

    #[tokio::test]
    async fn dry_run_leaves_no_watermarks() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let scheme = seed(&store, user, "Kisan", NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()).await;

        let run = run_with(store.clone(), Arc::new(LogChannel::new()), user).dry_run(true);
        let summary = run.run_once(at(2026, 10, 17)).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.results[0].record.bucket, UrgencyBucket::Expired);
        assert!(store.last_notified(user, scheme).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_outage_aborts_the_pass() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        seed(&store, user, "Kisan", NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()).await;
        store.set_unavailable(true);
        let run = run_with(store.clone(), Arc::new(LogChannel::new()), user);
        assert!(matches!(
            run.run_once(at(2026, 10, 17)).await,
            Err(ReminderError::Store(StoreError::Unavailable(_)))
        ));
    }

    /// Delivers, then takes the store down, as if the database dropped mid-pass.
    struct OutageAfterSend(Arc<MemoryStore>);

    #[async_trait]
    impl NotificationChannel for OutageAfterSend {
        fn name(&self) -> &str {
            "outage-after-send"
        }
        async fn ready(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), ChannelError> {
            self.0.set_unavailable(true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn watermark_write_failure_keeps_dispatch_results() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        seed(&store, user, "Kisan", NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()).await;
        seed(&store, user, "Awas", NaiveDate::from_ymd_opt(2026, 10, 21).unwrap()).await;

        let channel = Arc::new(OutageAfterSend(store.clone()));
        let run = run_with(store.clone(), channel, user);
        let summary = run.run_once(at(2026, 10, 17)).await.unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.watermark_errors, 2);
        assert_eq!(summary.results.len(), 2);
        assert!(summary
            .results
            .iter()
            .all(|r| r.status == DeliveryStatus::Sent));
    }
}
