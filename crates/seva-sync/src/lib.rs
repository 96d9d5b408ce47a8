//! Ingest and reminder orchestration for SchemeSeva.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use seva_notify::{
    Dispatcher, LogChannel, NotificationChannel, ResendChannel, StoreDirectory,
};
use seva_storage::{HttpFetcher, MemoryStore, PgStore, SchemeStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod ingest;
pub mod reminder;

pub use config::{build_source, SevaConfig, SourceConfig, SourceRegistry};
pub use ingest::{
    validate, IngestError, IngestPipeline, IngestResult, RejectReason, Rejection, ReviewItem,
};
pub use reminder::{ReminderError, ReminderRun, ReminderSummary};

pub const CRATE_NAME: &str = "seva-sync";

/// Postgres when `DATABASE_URL` is set, otherwise a fresh in-memory store.
pub async fn connect_store(config: &SevaConfig) -> Result<(Arc<dyn SchemeStore>, bool)> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok((Arc::new(store), true))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, data is lost on exit");
            Ok((Arc::new(MemoryStore::new()), false))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceIngestReport {
    pub source_id: String,
    pub fetched: usize,
    pub result: Option<IngestResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceIngestReport>,
}

impl IngestRunSummary {
    pub fn inserted(&self) -> usize {
        self.sources.iter().filter_map(|s| s.result.as_ref()).map(|r| r.inserted).sum()
    }

    pub fn updated(&self) -> usize {
        self.sources.iter().filter_map(|s| s.result.as_ref()).map(|r| r.updated).sum()
    }

    pub fn rejected(&self) -> usize {
        self.sources
            .iter()
            .filter_map(|s| s.result.as_ref())
            .map(|r| r.rejected.len())
            .sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

pub struct SevaEngine {
    config: SevaConfig,
    store: Arc<dyn SchemeStore>,
    http: Arc<HttpFetcher>,
}

impl SevaEngine {
    pub fn new(config: SevaConfig, store: Arc<dyn SchemeStore>) -> Result<Self> {
        let http = Arc::new(config.http_client()?);
        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub fn config(&self) -> &SevaConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SchemeStore> {
        Arc::clone(&self.store)
    }

    /// Pulls every enabled source and ingests each batch. A source that
    /// cannot be fetched is skipped; a store failure ends the run.
    pub async fn run_ingest_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        let pipeline = IngestPipeline::new(self.store());

        let mut sources = Vec::new();
        for source_config in registry.enabled() {
            let source = build_source(source_config, &self.config.workspace_root, self.http.clone());
            let raw = match source.fetch_latest().await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(source_id = %source_config.source_id, error = %err, "source fetch failed; skipping");
                    sources.push(SourceIngestReport {
                        source_id: source_config.source_id.clone(),
                        fetched: 0,
                        result: None,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };

            let fetched = raw.len();
            let result = pipeline
                .ingest(raw)
                .await
                .with_context(|| format!("ingesting {}", source_config.source_id))?;
            if result.rejected.is_empty() {
                info!(source_id = %source_config.source_id, "{}", result.summary());
            } else {
                warn!(source_id = %source_config.source_id, "{}", result.summary());
            }
            sources.push(SourceIngestReport {
                source_id: source_config.source_id.clone(),
                fetched,
                result: Some(result),
                error: None,
            });
        }

        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
        };
        info!(
            %run_id,
            inserted = summary.inserted(),
            updated = summary.updated(),
            rejected = summary.rejected(),
            failed_sources = summary.failed_sources(),
            "ingest run finished"
        );
        Ok(summary)
    }

    /// Resend when an API key is configured; otherwise, or for dry runs,
    /// messages only go to the log.
    pub fn channel(&self, dry_run: bool) -> Arc<dyn NotificationChannel> {
        match (&self.config.resend_api_key, dry_run) {
            (Some(key), false) => Arc::new(ResendChannel::new(
                self.http.clone(),
                key.clone(),
                self.config.mail_from.clone(),
            )),
            (None, false) => {
                warn!("RESEND_API_KEY not set; reminders will only be logged");
                Arc::new(LogChannel::new())
            }
            (_, true) => Arc::new(LogChannel::new()),
        }
    }

    pub fn reminder_run(&self, dry_run: bool) -> ReminderRun {
        let dispatcher = Dispatcher::new(
            self.channel(dry_run),
            Arc::new(StoreDirectory::new(self.store())),
            self.config.dispatch_config(),
        );
        ReminderRun::new(self.store(), dispatcher).dry_run(dry_run)
    }

    pub async fn run_reminders_once(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<ReminderSummary> {
        self.reminder_run(dry_run)
            .run_once(now)
            .await
            .context("running reminder pass")
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let engine = Arc::clone(self);
        let ingest = Job::new_async(&self.config.ingest_cron, move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                if let Err(err) = engine.run_ingest_once().await {
                    warn!(error = %format!("{err:#}"), "scheduled ingest failed");
                }
            })
        })
        .with_context(|| format!("creating ingest job for cron {}", self.config.ingest_cron))?;
        sched.add(ingest).await.context("adding ingest job")?;

        let engine = Arc::clone(self);
        let reminders = Job::new_async(&self.config.reminder_cron, move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                if let Err(err) = engine.run_reminders_once(Utc::now(), false).await {
                    warn!(error = %format!("{err:#}"), "scheduled reminder pass failed");
                }
            })
        })
        .with_context(|| format!("creating reminder job for cron {}", self.config.reminder_cron))?;
        sched.add(reminders).await.context("adding reminder job")?;

        Ok(Some(sched))
    }
}

pub async fn engine_from_env() -> Result<SevaEngine> {
    let config = SevaConfig::from_env();
    let (store, _) = connect_store(&config).await?;
    SevaEngine::new(config, store)
}
