//! Delivery channels and recipient directories.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use seva_storage::{FetchError, HttpFetcher, SchemeStore};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::FailureReason;

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("delivery timed out")]
    Timeout,
}

impl ChannelError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ChannelError::Unavailable(_) => FailureReason::ChannelUnavailable,
            ChannelError::InvalidRecipient(_) => FailureReason::InvalidRecipient,
            ChannelError::Timeout => FailureReason::Timeout,
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap check that the channel can accept messages at all.
    async fn ready(&self) -> Result<(), ChannelError>;

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ChannelError>;
}

/// Maps a failed Resend call onto a delivery failure. Client errors other than
/// throttling mean the provider rejected this message, not the channel.
pub fn classify_fetch_error(err: &FetchError) -> ChannelError {
    if err.is_timeout() {
        return ChannelError::Timeout;
    }
    match err.status() {
        Some(status) if (400..500).contains(&status) && status != 429 => {
            ChannelError::InvalidRecipient(err.to_string())
        }
        _ => ChannelError::Unavailable(err.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct ResendChannel {
    http: Arc<HttpFetcher>,
    api_key: String,
    from: String,
}

impl ResendChannel {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for ResendChannel {
    fn name(&self) -> &str {
        "resend"
    }

    async fn ready(&self) -> Result<(), ChannelError> {
        if self.api_key.trim().is_empty() {
            return Err(ChannelError::Unavailable("RESEND_API_KEY is not set".into()));
        }
        if !self.from.contains('@') {
            return Err(ChannelError::Unavailable(format!(
                "sender address {:?} is not an email address",
                self.from
            )));
        }
        Ok(())
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let payload = json!({
            "from": self.from,
            "to": [recipient],
            "subject": subject,
            "text": body,
        });
        self.http
            .post_json("resend", RESEND_ENDPOINT, &self.api_key, &payload)
            .await
            .map(|_| ())
            .map_err(|e| classify_fetch_error(&e))
    }
}

/// Dry-run channel: logs each message and keeps a copy.
#[derive(Debug, Default)]
pub struct LogChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl LogChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// (recipient, subject) pairs in send order.
    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn ready(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        tracing::info!(recipient, subject, body_len = body.len(), "reminder (dry run)");
        self.sent
            .lock()
            .await
            .push((recipient.to_string(), subject.to_string()));
        Ok(())
    }
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Delivery address for `user_id`, if one is known.
    async fn resolve(&self, user_id: Uuid) -> Result<Option<String>, ChannelError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    addresses: HashMap<Uuid, String>,
}

impl StaticDirectory {
    pub fn with(mut self, user_id: Uuid, address: impl Into<String>) -> Self {
        self.addresses.insert(user_id, address.into());
        self
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn resolve(&self, user_id: Uuid) -> Result<Option<String>, ChannelError> {
        Ok(self.addresses.get(&user_id).cloned())
    }
}

/// Reads `contact_email` from the user's stored profile.
pub struct StoreDirectory {
    store: Arc<dyn SchemeStore>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn SchemeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecipientDirectory for StoreDirectory {
    async fn resolve(&self, user_id: Uuid) -> Result<Option<String>, ChannelError> {
        let profile = self
            .store
            .get_profile(user_id)
            .await
            .map_err(|e| ChannelError::Unavailable(format!("loading profile: {e}")))?;
        Ok(profile
            .and_then(|p| p.contact_email)
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty()))
    }
}
