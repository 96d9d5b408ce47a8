use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use seva_sync::{connect_store, SevaConfig, SevaEngine};
use seva_web::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "seva")]
#[command(about = "SchemeSeva deadline and notification engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source and upsert the schemes it lists.
    Ingest,
    /// Send deadline reminders for bookmarked schemes.
    Notify {
        /// Log reminders instead of sending them; no watermarks are written.
        #[arg(long)]
        dry_run: bool,
        /// Evaluate deadlines as of this date (YYYY-MM-DD) instead of today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Serve the JSON API.
    Serve,
    /// Run the ingest and reminder cron jobs until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SEVA_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = SevaConfig::from_env();
    let (store, persistent) = connect_store(&config).await?;
    let engine = Arc::new(SevaEngine::new(config, store)?);

    match cli.command {
        Commands::Ingest => {
            let summary = engine.run_ingest_once().await?;
            for source in &summary.sources {
                match (&source.result, &source.error) {
                    (Some(result), _) => println!("{}: {}", source.source_id, result.summary()),
                    (None, Some(err)) => println!("{}: skipped ({err})", source.source_id),
                    (None, None) => {}
                }
            }
            println!(
                "ingest complete: run_id={} inserted={} updated={} rejected={} failed_sources={}",
                summary.run_id,
                summary.inserted(),
                summary.updated(),
                summary.rejected(),
                summary.failed_sources()
            );
        }
        Commands::Notify { dry_run, date } => {
            if !persistent {
                tracing::warn!("in-memory store has no bookmarks; set DATABASE_URL to notify real users");
            }
            let now = match date {
                Some(date) => date.and_time(NaiveTime::MIN).and_utc(),
                None => Utc::now(),
            };
            let summary = engine.run_reminders_once(now, dry_run).await?;
            println!(
                "reminders complete: users={} generated={} suppressed={} sent={} failed={} skipped_missing={} watermark_errors={}{}",
                summary.users,
                summary.generated,
                summary.suppressed,
                summary.sent,
                summary.failed,
                summary.skipped_missing,
                summary.watermark_errors,
                if dry_run { " (dry run)" } else { "" }
            );
        }
        Commands::Serve => {
            if !persistent {
                engine
                    .run_ingest_once()
                    .await
                    .context("seeding in-memory store")?;
            }
            let scheduler = engine.maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
            }
            seva_web::serve(AppState::new(engine.store()), engine.config().web_port).await?;
        }
        Commands::Schedule => {
            let Some(mut scheduler) = engine.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set SEVA_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            tracing::info!(
                ingest_cron = %engine.config().ingest_cron,
                reminder_cron = %engine.config().reminder_cron,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
