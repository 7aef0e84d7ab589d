use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{map_provider_status, AiError, AiProvider, GenerationRequest, GenerationStatus};
use crate::models::job::JobStatus;

pub struct LiveAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    #[serde(alias = "task_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusBody {
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    output_url: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

impl LiveAiProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_settings(settings: &crate::config::AiSettings) -> Result<Self, AiError> {
        Self::new(
            settings.base_url.clone(),
            settings.api_key.clone(),
            settings.request_timeout,
        )
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, AiError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| error_text(v.get("error").or(v.get("detail"))?))
                .unwrap_or_else(|| body.trim().to_string());
            return Err(AiError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(map) => map.get("message").and_then(error_text),
        _ => None,
    }
}

fn output_url(body: &TaskStatusBody) -> Option<String> {
    if let Some(url) = body.output_url.as_ref().filter(|u| !u.is_empty()) {
        return Some(url.clone());
    }
    match body.output.as_ref()? {
        Value::String(url) if !url.is_empty() => Some(url.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            .map(str::to_string),
        _ => None,
    }
}

#[async_trait]
impl AiProvider for LiveAiProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<String, AiError> {
        let body = self
            .send(self.client.post(self.url("generations")).json(&request))
            .await?;
        let created: CreatedTask = serde_json::from_str(&body)
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
        debug!(task_id = %created.id, "generation submitted");
        Ok(created.id)
    }

    async fn check_status(&self, external_task_id: &str) -> Result<GenerationStatus, AiError> {
        let path = format!("generations/{}", external_task_id);
        let body = self.send(self.client.get(self.url(&path))).await?;
        let parsed: TaskStatusBody = serde_json::from_str(&body)
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;

        let status = map_provider_status(&parsed.status);
        Ok(match status {
            JobStatus::Completed => GenerationStatus {
                status,
                output_url: output_url(&parsed),
                error_message: None,
            },
            JobStatus::Failed => GenerationStatus {
                status,
                output_url: None,
                error_message: parsed.error.as_ref().and_then(error_text),
            },
            _ => GenerationStatus {
                status,
                output_url: None,
                error_message: None,
            },
        })
    }
}
