use async_trait::async_trait;
use uuid::Uuid;

use crate::models::job::{Job, NewJob};

/// Persisted image-generation jobs.
///
/// The transition methods are conditional writes: they only touch a job that is still
/// in flight and return `None` when it already reached a terminal state (or does not exist).
/// Completion is charged, so it lives on
/// [`CreditLedgerRepository`](crate::db::credit_ledger_repository::CreditLedgerRepository).
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, sqlx::Error>;

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error>;

    async fn find_job_for_user(
        &self,
        user_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Job>, sqlx::Error>;

    async fn list_jobs_for_project(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Job>, sqlx::Error>;

    /// Non-terminal jobs with a provider task handle, oldest first, skipping `exclude`.
    async fn list_pollable_jobs(
        &self,
        exclude: &[Uuid],
        limit: i64,
    ) -> Result<Vec<Job>, sqlx::Error>;

    async fn list_pollable_jobs_for_user(&self, user_id: Uuid) -> Result<Vec<Job>, sqlx::Error>;

    async fn mark_processing(
        &self,
        job_id: Uuid,
        external_task_id: &str,
    ) -> Result<Option<Job>, sqlx::Error>;

    async fn fail_job(&self, job_id: Uuid, error_message: &str)
        -> Result<Option<Job>, sqlx::Error>;
}
