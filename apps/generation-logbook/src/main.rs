use anyhow::Result;
use clap::Parser;
use generation_logbook::cli::{Args, OnceTarget};
use generation_logbook::config::Config;
use generation_logbook::db;
use generation_logbook::services::{self, now_local};
use generation_logbook::source::{SeriesSource, SqlSeriesSource};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,generation_logbook=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn run_once(
    config: &Config,
    source: Arc<dyn SeriesSource>,
    target: OnceTarget,
    at: Option<chrono::NaiveDateTime>,
) -> Result<()> {
    let now = at.unwrap_or_else(now_local);
    match target {
        OnceTarget::Hourly => services::hourly(config, source).run_once(now).await,
        OnceTarget::Shift => services::shift(config, source).run_once(now).await,
        OnceTarget::Outage => services::outage(config, source).run_once(now).await,
        OnceTarget::Merge => {
            let hourly = services::hourly(config, source.clone()).merge().await?;
            let shift = services::shift(config, source.clone()).merge().await?;
            let outage = services::outage(config, source).merge().await?;
            for (log, report) in [("hourly", hourly), ("shift", shift), ("outage", outage)] {
                tracing::info!(
                    log,
                    committed = report.committed.len(),
                    locked = report.locked.len(),
                    failed = report.failed.len(),
                    missing_sheet = report.missing_sheet.len(),
                    "merge finished"
                );
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let config = Config::from_env()?;
    let pool = db::connect_lazy(&config.database_url, config.db_pool_size)?;
    let source: Arc<dyn SeriesSource> = Arc::new(SqlSeriesSource::new(pool, &config.series_table));

    if let Some(target) = args.once {
        return run_once(&config, source, target, args.at).await;
    }

    tracing::info!(
        output_dir = %config.output_dir.display(),
        buffer_dir = %config.buffer_dir.display(),
        hourly = config.enable_hourly,
        shift = config.enable_shift,
        outage = config.enable_outage,
        "generation-logbook starting"
    );
    let cancel = CancellationToken::new();
    let handles = services::start_all(&config, source, cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "stream task exited abnormally");
        }
    }
    Ok(())
}
