//! Reminder delivery for SchemeSeva.
//!
//! The [`Dispatcher`] takes generated [`NotificationRecord`]s, resolves a
//! recipient for each user, renders the reminder and hands it to a
//! [`NotificationChannel`]. Every input record gets exactly one
//! [`DispatchResult`], in input order, whatever happens to its neighbours.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use seva_core::NotificationRecord;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{info_span, Instrument};

pub mod channel;
pub mod message;

pub use channel::{
    classify_fetch_error, ChannelError, LogChannel, NotificationChannel, RecipientDirectory,
    ResendChannel, StaticDirectory, StoreDirectory,
};
pub use message::{render, RenderedMessage};

pub const CRATE_NAME: &str = "seva-notify";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    ChannelUnavailable,
    InvalidRecipient,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub record: NotificationRecord,
    pub status: DeliveryStatus,
    pub error: Option<FailureReason>,
}

impl DispatchResult {
    fn sent(record: NotificationRecord) -> Self {
        Self {
            record,
            status: DeliveryStatus::Sent,
            error: None,
        }
    }

    fn failed(record: NotificationRecord, reason: FailureReason) -> Self {
        Self {
            record,
            status: DeliveryStatus::Failed,
            error: Some(reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification channel {channel} is unreachable: {source}")]
    ChannelUnreachable {
        channel: String,
        #[source]
        source: ChannelError,
    },
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub concurrency: usize,
    /// Budget for the whole call; unfinished items fail with `Timeout`.
    pub batch_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batch_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    /// Records worth retrying on a later run.
    pub retryable: Vec<NotificationRecord>,
}

impl DispatchSummary {
    pub fn from_results(results: &[DispatchResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.status {
                DeliveryStatus::Sent => summary.sent += 1,
                DeliveryStatus::Failed => {
                    summary.failed += 1;
                    summary.retryable.push(result.record.clone());
                }
            }
        }
        summary
    }
}

pub struct Dispatcher {
    channel: Arc<dyn NotificationChannel>,
    directory: Arc<dyn RecipientDirectory>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        directory: Arc<dyn RecipientDirectory>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            channel,
            directory,
            config,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    pub async fn dispatch(
        &self,
        records: Vec<NotificationRecord>,
    ) -> Result<Vec<DispatchResult>, DispatchError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.channel
            .ready()
            .await
            .map_err(|source| DispatchError::ChannelUnreachable {
                channel: self.channel.name().to_string(),
                source,
            })?;

        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, record) in records.iter().cloned().enumerate() {
            let channel = Arc::clone(&self.channel);
            let directory = Arc::clone(&self.directory);
            let limit = Arc::clone(&limit);
            let span = info_span!(
                "dispatch_item",
                user_id = %record.user_id,
                scheme_id = %record.scheme_id,
                bucket = record.bucket.as_str()
            );
            tasks.spawn(
                async move {
                    let outcome = match limit.acquire_owned().await {
                        Ok(_permit) => deliver(channel.as_ref(), directory.as_ref(), &record).await,
                        Err(_) => Err(ChannelError::Unavailable("dispatch limiter closed".into())),
                    };
                    if let Err(err) = &outcome {
                        tracing::warn!(error = %err, "reminder delivery failed");
                    }
                    (index, outcome)
                }
                .instrument(span),
            );
        }

        let deadline = self.config.batch_timeout.map(|budget| Instant::now() + budget);
        let mut outcomes: Vec<Option<Result<(), ChannelError>>> = vec![None; records.len()];
        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            match next {
                Some(Ok((index, outcome))) => outcomes[index] = Some(outcome),
                Some(Err(join_err)) => {
                    tracing::warn!(error = %join_err, "dispatch task did not complete");
                }
                None => break,
            }
        }

        let unfinished = if timed_out {
            FailureReason::Timeout
        } else {
            FailureReason::ChannelUnavailable
        };
        let results = records
            .into_iter()
            .zip(outcomes)
            .map(|(record, outcome)| match outcome {
                Some(Ok(())) => DispatchResult::sent(record),
                Some(Err(err)) => DispatchResult::failed(record, err.reason()),
                None => DispatchResult::failed(record, unfinished),
            })
            .collect::<Vec<_>>();

        let summary = DispatchSummary::from_results(&results);
        tracing::info!(
            channel = self.channel.name(),
            sent = summary.sent,
            failed = summary.failed,
            timed_out,
            "dispatch finished"
        );
        Ok(results)
    }
}

async fn deliver(
    channel: &dyn NotificationChannel,
    directory: &dyn RecipientDirectory,
    record: &NotificationRecord,
) -> Result<(), ChannelError> {
    let recipient = directory.resolve(record.user_id).await?.ok_or_else(|| {
        ChannelError::InvalidRecipient(format!("no contact address for user {}", record.user_id))
    })?;
    let message = render(record)
        .map_err(|e| ChannelError::Unavailable(format!("rendering reminder: {e}")))?;
    channel.send(&recipient, &message.subject, &message.body).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use seva_core::UrgencyBucket;
    use uuid::Uuid;

    use super::*;

    fn record(user: Uuid, name: &str, days: i64) -> NotificationRecord {
        let now = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        NotificationRecord {
            user_id: user,
            scheme_id: Uuid::new_v4(),
            scheme_name: name.into(),
            deadline: now + chrono::Duration::days(days),
            days_remaining: days,
            bucket: UrgencyBucket::from_days_remaining(days),
        }
    }

    /// Fails or stalls on subjects mentioning the configured scheme names.
    struct ScriptedChannel {
        failing: HashSet<String>,
        stalling: HashSet<String>,
        ready: bool,
    }

    impl ScriptedChannel {
        fn healthy() -> Self {
            Self {
                failing: HashSet::new(),
                stalling: HashSet::new(),
                ready: true,
            }
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn ready(&self) -> Result<(), ChannelError> {
            if self.ready {
                Ok(())
            } else {
                Err(ChannelError::Unavailable("provider down".into()))
            }
        }

        async fn send(&self, _recipient: &str, subject: &str, _body: &str) -> Result<(), ChannelError> {
            if self.stalling.iter().any(|name| subject.contains(name.as_str())) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.failing.iter().any(|name| subject.contains(name.as_str())) {
                return Err(ChannelError::Unavailable("smtp relay refused".into()));
            }
            Ok(())
        }
    }

    fn dispatcher(channel: ScriptedChannel, directory: StaticDirectory, config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(channel), Arc::new(directory), config)
    }

    #[tokio::test]
    async fn middle_failure_is_isolated() {
        let user = Uuid::new_v4();
        let mut channel = ScriptedChannel::healthy();
        channel.failing.insert("Beta".into());
        let d = dispatcher(
            channel,
            StaticDirectory::default().with(user, "asha@example.in"),
            DispatchConfig::default(),
        );

        let records = vec![record(user, "Alpha", 1), record(user, "Beta", 2), record(user, "Gamma", 3)];
        let results = d.dispatch(records.clone()).await.unwrap();

        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![DeliveryStatus::Sent, DeliveryStatus::Failed, DeliveryStatus::Sent]
        );
        assert_eq!(results[1].error, Some(FailureReason::ChannelUnavailable));
        let echoed: Vec<_> = results.into_iter().map(|r| r.record).collect();
        assert_eq!(echoed, records);
    }

    #[tokio::test]
    async fn unknown_recipient_fails_only_that_item() {
        let known = Uuid::new_v4();
        let d = dispatcher(
            ScriptedChannel::healthy(),
            StaticDirectory::default().with(known, "known@example.in"),
            DispatchConfig::default(),
        );
        let results = d
            .dispatch(vec![record(Uuid::new_v4(), "Alpha", 1), record(known, "Beta", 2)])
            .await
            .unwrap();
        assert_eq!(results[0].error, Some(FailureReason::InvalidRecipient));
        assert_eq!(results[1].status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn unready_channel_is_a_dispatch_error() {
        let mut channel = ScriptedChannel::healthy();
        channel.ready = false;
        let user = Uuid::new_v4();
        let d = dispatcher(
            channel,
            StaticDirectory::default().with(user, "a@example.in"),
            DispatchConfig::default(),
        );
        assert!(matches!(
            d.dispatch(vec![record(user, "Alpha", 1)]).await,
            Err(DispatchError::ChannelUnreachable { .. })
        ));
        // Nothing to send, so skip the readiness check.
        assert!(d.dispatch(Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_timeout_keeps_finished_items() {
        let user = Uuid::new_v4();
        let mut channel = ScriptedChannel::healthy();
        channel.stalling.insert("Slow".into());
        let d = dispatcher(
            channel,
            StaticDirectory::default().with(user, "a@example.in"),
            DispatchConfig {
                concurrency: 4,
                batch_timeout: Some(Duration::from_millis(200)),
            },
        );
        let results = d
            .dispatch(vec![record(user, "Fast", 1), record(user, "Slow", 2), record(user, "Quick", 3)])
            .await
            .unwrap();
        assert_eq!(results[0].status, DeliveryStatus::Sent);
        assert_eq!(results[1].error, Some(FailureReason::Timeout));
        assert_eq!(results[2].status, DeliveryStatus::Sent);

        let summary = DispatchSummary::from_results(&results);
        assert_eq!((summary.sent, summary.failed), (2, 1));
        assert_eq!(summary.retryable[0].scheme_name, "Slow");
    }

    #[tokio::test]
    async fn concurrency_of_one_still_delivers_everything_in_order() {
        let user = Uuid::new_v4();
        let d = dispatcher(
            ScriptedChannel::healthy(),
            StaticDirectory::default().with(user, "a@example.in"),
            DispatchConfig {
                concurrency: 1,
                batch_timeout: None,
            },
        );
        let records: Vec<_> = (0..10).map(|i| record(user, &format!("Scheme {i}"), i)).collect();
        let results = d.dispatch(records.clone()).await.unwrap();
        assert!(results.iter().all(|r| r.status == DeliveryStatus::Sent));
        assert_eq!(results.into_iter().map(|r| r.record).collect::<Vec<_>>(), records);
    }
}
