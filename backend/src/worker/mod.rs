use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::job::Job;
use crate::state::AppState;
use crate::sync::age_timeout_message;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub handed_off: usize,
}

/// Periodically hands every in-flight job to the synchronizer, so generation progress does
/// not depend on a client keeping a sync session open.
pub fn start_background_workers(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let every = state.config.sync.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sweep_in_flight_jobs(&state).await {
                        error!(?err, "worker: error sweeping in-flight jobs");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("worker: sweep stopped");
    })
}

fn age_of(job: &Job, now: OffsetDateTime) -> Duration {
    let age = now - job.created_at;
    Duration::from_secs(age.whole_seconds().max(0) as u64)
}

pub async fn sweep_in_flight_jobs(state: &AppState) -> Result<SweepReport, sqlx::Error> {
    let settings = &state.config.sync;
    let tracked = state.synchronizer.tracked_job_ids();
    let jobs = state
        .job_repo
        .list_pollable_jobs(&tracked, settings.sweep_batch)
        .await?;
    let now = OffsetDateTime::now_utc();
    let mut report = SweepReport::default();

    let mut fresh = Vec::new();
    for job in jobs {
        if state.synchronizer.is_tracking(job.id) {
            continue;
        }
        let age = age_of(&job, now);
        if age < settings.max_job_age {
            fresh.push(job);
            continue;
        }
        let job_id = job.id;
        match state
            .synchronizer
            .force_timeout(job, &age_timeout_message(age))
            .await
        {
            Ok(_) => report.expired += 1,
            Err(err) => warn!(%job_id, %err, "worker: failed to expire job"),
        }
    }

    if let Some(handle) = state.synchronizer.start_sync(fresh, None) {
        report.handed_off = handle.job_ids.len();
    }
    if report != SweepReport::default() {
        info!(expired = report.expired, handed_off = report.handed_off, "worker: swept in-flight jobs");
    }
    Ok(report)
}
