use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::job_repository::JobRepository;
use crate::models::job::{Job, NewJob};

pub(crate) const JOB_COLUMNS: &str = "id, user_id, project_id, transformation, input_image_url, prompt, \
     external_task_id, status, output_url, error_message, created_at, updated_at, completed_at";

pub struct PostgresJobRepository {
    pub pool: PgPool,
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO jobs (user_id, project_id, transformation, input_image_url, prompt, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', now(), now())
            RETURNING {JOB_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(new_job.user_id)
            .bind(new_job.project_id)
            .bind(new_job.transformation)
            .bind(&new_job.input_image_url)
            .bind(new_job.prompt.as_deref())
            .fetch_one(&self.pool)
            .await
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_job_for_user(
        &self,
        user_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Job>, sqlx::Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 AND id = $2");
        sqlx::query_as::<_, Job>(&sql)
            .bind(user_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_jobs_for_project(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE user_id = $1 AND project_id = $2
            ORDER BY created_at DESC
            "#
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(user_id)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn list_pollable_jobs(
        &self,
        exclude: &[Uuid],
        limit: i64,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ('pending', 'processing')
              AND external_task_id IS NOT NULL
              AND NOT (id = ANY($1))
            ORDER BY created_at ASC
            LIMIT $2
            "#
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(exclude)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    async fn list_pollable_jobs_for_user(&self, user_id: Uuid) -> Result<Vec<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE user_id = $1
              AND status IN ('pending', 'processing')
              AND external_task_id IS NOT NULL
            ORDER BY created_at ASC
            "#
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn mark_processing(
        &self,
        job_id: Uuid,
        external_task_id: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing', external_task_id = $2, updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(external_task_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'failed', error_message = $2, updated_at = now(), completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {JOB_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(error_message)
            .fetch_optional(&self.pool)
            .await
    }
}
