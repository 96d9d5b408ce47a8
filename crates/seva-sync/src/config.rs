use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use seva_adapters::{
    FixtureSource, HtmlPortalSource, JsonFeedSource, ListingSelectors, ScrapeSource, SourceKind,
};
use seva_notify::DispatchConfig;
use seva_storage::{HttpClientConfig, HttpFetcher};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    /// Bundle path (relative to the workspace root) or feed/portal URL.
    pub location: String,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub fn build_source(
    source: &SourceConfig,
    workspace_root: &Path,
    http: Arc<HttpFetcher>,
) -> Box<dyn ScrapeSource> {
    match source.kind {
        SourceKind::Fixture => {
            let path = PathBuf::from(&source.location);
            let path = if path.is_absolute() {
                path
            } else {
                workspace_root.join(path)
            };
            Box::new(FixtureSource::new(&source.source_id, path))
        }
        SourceKind::JsonFeed => Box::new(JsonFeedSource::new(
            &source.source_id,
            &source.location,
            http,
        )),
        SourceKind::HtmlPortal => Box::new(HtmlPortalSource::new(
            &source.source_id,
            &source.location,
            source.selectors.clone().unwrap_or_default(),
            http,
        )),
    }
}

#[derive(Debug, Clone)]
pub struct SevaConfig {
    /// No URL means the in-memory store.
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub reminder_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub dispatch_concurrency: usize,
    pub dispatch_timeout_secs: u64,
    pub resend_api_key: Option<String>,
    pub mail_from: String,
    pub web_port: u16,
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn number<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl SevaConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            workspace_root: non_empty("SEVA_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            scheduler_enabled: flag(lookup("SEVA_SCHEDULER_ENABLED")),
            ingest_cron: non_empty("SEVA_INGEST_CRON").unwrap_or_else(|| "0 0 5 * * *".to_string()),
            reminder_cron: non_empty("SEVA_REMINDER_CRON")
                .unwrap_or_else(|| "0 0 8 * * *".to_string()),
            user_agent: non_empty("SEVA_USER_AGENT").unwrap_or_else(|| "schemeseva-bot/0.1".to_string()),
            http_timeout_secs: number(lookup("SEVA_HTTP_TIMEOUT_SECS"), 20),
            dispatch_concurrency: number(lookup("SEVA_DISPATCH_CONCURRENCY"), 8),
            dispatch_timeout_secs: number(lookup("SEVA_DISPATCH_TIMEOUT_SECS"), 120),
            resend_api_key: non_empty("RESEND_API_KEY"),
            mail_from: non_empty("SEVA_MAIL_FROM")
                .unwrap_or_else(|| "SchemeSeva <reminders@schemeseva.in>".to_string()),
            web_port: number(lookup("SEVA_WEB_PORT"), 8000),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn http_client(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            concurrency: self.dispatch_concurrency.max(1),
            batch_timeout: (self.dispatch_timeout_secs > 0)
                .then(|| Duration::from_secs(self.dispatch_timeout_secs)),
        }
    }
}
