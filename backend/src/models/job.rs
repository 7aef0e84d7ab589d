use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Transitions only move forward, and nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Depersonalization,
    HomeStaging,
    Renovation,
}

impl Transformation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transformation::Depersonalization => "depersonalization",
            Transformation::HomeStaging => "home_staging",
            Transformation::Renovation => "renovation",
        }
    }
}

#[derive(Debug, FromRow, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub transformation: Transformation,
    pub input_image_url: String,
    pub prompt: Option<String>,
    pub external_task_id: Option<String>,
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A job is only polled while it is in flight and the provider has issued a handle.
    pub fn is_pollable(&self) -> bool {
        !self.is_terminal() && self.external_task_id.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub transformation: Transformation,
    pub input_image_url: String,
    pub prompt: Option<String>,
}
