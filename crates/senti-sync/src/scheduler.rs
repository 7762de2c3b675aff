use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::run_with_config;

/// Run a sync on `config.sync_cron` until Ctrl-C. A tick that fires while the previous run
/// is still going is skipped.
pub async fn run_scheduled(config: SyncConfig) -> Result<()> {
    let cron = config.sync_cron.clone();
    let running = std::sync::Arc::new(tokio::sync::Mutex::new(()));

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping this tick");
                return;
            };
            match run_with_config(config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    rows = summary.rows_written(),
                    exit = summary.exit.code(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(
                    exit = err.exit.code(),
                    error = %err,
                    "scheduled sync could not start"
                ),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
