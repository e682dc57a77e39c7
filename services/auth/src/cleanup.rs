//! Periodic deletion of expired OTP records

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::service::OtpService;

/// Start the cleanup job on `schedule` (cron with a seconds field).
///
/// The returned scheduler must be kept alive for the job to keep running.
pub async fn start_cleanup(service: OtpService, schedule: &str) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_, _| {
        let service = service.clone();
        Box::pin(async move {
            match service.purge_expired().await {
                Ok(deleted) => info!("OTP cleanup job removed {} records", deleted),
                Err(e) => error!("OTP cleanup job failed: {}", e),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    info!("Started OTP cleanup scheduler with schedule: {}", schedule);
    Ok(scheduler)
}
