//! Client side of the image-generation provider: submit a transformation, then poll it.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::job::{Job, JobStatus, Transformation};

mod live;
#[cfg(test)]
mod mock;

pub use live::LiveAiProvider;
#[cfg(test)]
pub use mock::{MockAiProvider, ScriptedStatus};

#[derive(Debug, Error)]
pub enum AiError {
    #[error("ai provider request failed: {0}")]
    Transport(String),
    #[error("ai provider responded with status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("ai provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub image_url: String,
    pub transformation: Transformation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl From<&Job> for GenerationRequest {
    fn from(job: &Job) -> Self {
        GenerationRequest {
            image_url: job.input_image_url.clone(),
            transformation: job.transformation,
            prompt: job.prompt.clone(),
        }
    }
}

/// Provider status normalized onto the job lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStatus {
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
}

impl GenerationStatus {
    pub fn in_progress() -> Self {
        Self {
            status: JobStatus::Processing,
            output_url: None,
            error_message: None,
        }
    }

    pub fn completed(output_url: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            output_url: Some(output_url.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            output_url: None,
            error_message: Some(message.into()),
        }
    }
}

/// Maps the provider's status vocabulary. Unknown values keep the job polling.
pub fn map_provider_status(raw: &str) -> JobStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "queued" | "pending" | "starting" => JobStatus::Pending,
        "processing" | "running" | "in_progress" => JobStatus::Processing,
        "succeeded" | "completed" | "success" => JobStatus::Completed,
        "failed" | "error" | "canceled" | "cancelled" => JobStatus::Failed,
        _ => JobStatus::Processing,
    }
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Submits a transformation and returns the provider's task handle.
    async fn generate(&self, request: GenerationRequest) -> Result<String, AiError>;

    async fn check_status(&self, external_task_id: &str) -> Result<GenerationStatus, AiError>;
}
