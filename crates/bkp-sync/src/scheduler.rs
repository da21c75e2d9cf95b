use std::sync::Arc;

use anyhow::{Context, Result};
use bkp_monalisa::PassSource;
use bkp_storage::PassStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::{MonAlisaSynchronizer, SyncConfig};

/// Schedules a first run after the initial delay and then one every synchronization period.
///
/// Returns `None` when synchronization is disabled.
pub async fn build_scheduler<S, T>(
    config: &SyncConfig,
    synchronizer: Arc<MonAlisaSynchronizer<S, T>>,
) -> Result<Option<JobScheduler>>
where
    S: PassSource + 'static,
    T: PassStore + 'static,
{
    if !config.enable_synchronization {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let first = Arc::clone(&synchronizer);
    let initial = Job::new_one_shot_async(config.initial_delay, move |_uuid, _l| {
        let synchronizer = Arc::clone(&first);
        Box::pin(async move {
            synchronizer.synchronize().await;
        })
    })
    .context("creating initial synchronization job")?;
    sched
        .add(initial)
        .await
        .context("adding initial synchronization job")?;

    let periodic = Job::new_repeated_async(config.synchronization_period, move |_uuid, _l| {
        let synchronizer = Arc::clone(&synchronizer);
        Box::pin(async move {
            synchronizer.synchronize().await;
        })
    })
    .context("creating periodic synchronization job")?;
    sched
        .add(periodic)
        .await
        .context("adding periodic synchronization job")?;

    info!(
        initial_delay_secs = config.initial_delay.as_secs(),
        period_secs = config.synchronization_period.as_secs(),
        "scheduled MonAlisa synchronization"
    );
    Ok(Some(sched))
}
