use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::credit_ledger_repository::LedgerError;
use crate::db::job_repository::JobRepository;
use crate::models::job::{Job, JobStatus};
use crate::services::ai::{AiError, AiProvider, GenerationStatus};
use crate::services::credits::CreditLedger;
use crate::services::invalidation::{Invalidation, InvalidationBus};

pub const TIMEOUT_ERROR_PREFIX: &str = "timed out waiting for generation";
const MISSING_OUTPUT_ERROR: &str = "generation completed without output";
const UNKNOWN_FAILURE_ERROR: &str = "generation failed";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] AiError),
    #[error("job storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub fn timeout_message(attempts: u32) -> String {
    format!("{TIMEOUT_ERROR_PREFIX} after {attempts} status checks")
}

pub fn age_timeout_message(age: Duration) -> String {
    format!("{TIMEOUT_ERROR_PREFIX} after {} minutes", age.as_secs() / 60)
}

/// Polls a single job and applies the result. Every write is conditional on the job
/// still being in flight, so concurrent or late checks cannot move a terminal job.
/// Completion and its usage debit are one write: a ledger failure leaves the job in
/// flight for the next check.
pub struct JobStatusChecker {
    jobs: Arc<dyn JobRepository>,
    ai: Arc<dyn AiProvider>,
    ledger: CreditLedger,
    invalidation: InvalidationBus,
    generation_cost: i64,
}

impl JobStatusChecker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        ai: Arc<dyn AiProvider>,
        ledger: CreditLedger,
        invalidation: InvalidationBus,
        generation_cost: i64,
    ) -> Self {
        Self {
            jobs,
            ai,
            ledger,
            invalidation,
            generation_cost,
        }
    }

    pub async fn check_one(&self, job: Job) -> Result<Job, SyncError> {
        let Some(task_id) = job.external_task_id.clone().filter(|_| !job.is_terminal()) else {
            return Ok(job);
        };

        let remote = self.ai.check_status(&task_id).await?;
        debug!(job_id = %job.id, %task_id, status = remote.status.as_str(), "provider status");

        match remote.status {
            JobStatus::Pending => Ok(job),
            JobStatus::Processing if job.status == JobStatus::Processing => Ok(job),
            JobStatus::Processing => {
                let updated = self.jobs.mark_processing(job.id, &task_id).await?;
                self.settle_write(job, updated).await
            }
            JobStatus::Completed | JobStatus::Failed => self.finish(job, remote).await,
        }
    }

    /// Fails a job that ran out of polling budget. `message` should start with
    /// [`TIMEOUT_ERROR_PREFIX`].
    pub async fn force_timeout(&self, job: Job, message: &str) -> Result<Job, SyncError> {
        let updated = self.jobs.fail_job(job.id, message).await?;
        if let Some(failed) = &updated {
            warn!(job_id = %failed.id, message, "job timed out");
            self.publish_terminal(failed);
        }
        self.settle_write(job, updated).await
    }

    async fn finish(&self, job: Job, remote: GenerationStatus) -> Result<Job, SyncError> {
        let output = remote.output_url.filter(|url| !url.trim().is_empty());
        let updated = match (remote.status, output) {
            (JobStatus::Completed, Some(url)) => self
                .ledger
                .complete_job(&job, &url, self.generation_cost)
                .await?
                .map(|(completed, _)| completed),
            (JobStatus::Completed, None) => {
                self.jobs.fail_job(job.id, MISSING_OUTPUT_ERROR).await?
            }
            _ => {
                let message = remote
                    .error_message
                    .unwrap_or_else(|| UNKNOWN_FAILURE_ERROR.to_string());
                self.jobs.fail_job(job.id, &message).await?
            }
        };

        if let Some(terminal) = &updated {
            info!(job_id = %terminal.id, status = terminal.status.as_str(), "job finished");
            self.publish_terminal(terminal);
        }
        self.settle_write(job, updated).await
    }

    fn publish_terminal(&self, job: &Job) {
        self.invalidation.publish(Invalidation::ProjectImages {
            user_id: job.user_id,
            project_id: job.project_id,
        });
        if job.status == JobStatus::Completed {
            self.invalidation.publish(Invalidation::CreditBalance {
                user_id: job.user_id,
            });
            self.invalidation.publish(Invalidation::UserStats {
                user_id: job.user_id,
            });
        }
    }

    /// A write that matched nothing lost a race; the stored row is the truth.
    async fn settle_write(&self, job: Job, updated: Option<Job>) -> Result<Job, SyncError> {
        match updated {
            Some(job) => Ok(job),
            None => Ok(self.jobs.find_job(job.id).await?.unwrap_or(job)),
        }
    }
}
