use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::job::{JobStatus, NewJob, Transformation};
use crate::responses::JsonResponse;
use crate::routes::auth::AuthSession;
use crate::services::ai::GenerationRequest;
use crate::services::invalidation::Invalidation;
use crate::state::AppState;

/// Clients may not poll faster than this.
const MIN_CLIENT_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    pub image_url: String,
    pub transformation: Transformation,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncParams {
    pub interval_ms: Option<u64>,
}

fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    (url.starts_with("https://") || url.starts_with("http://")) && url.len() > "https://".len()
}

// POST /api/projects/{project_id}/jobs
pub async fn submit_job(
    State(app_state): State<AppState>,
    auth: AuthSession,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<SubmitJob>,
) -> Response {
    let user_id = auth.user_id;
    if !is_http_url(&payload.image_url) {
        return JsonResponse::bad_request("image_url must be an http(s) URL").into_response();
    }

    let cost = app_state.config.billing.generation_credit_cost;
    match app_state.ledger.balance(user_id).await {
        Ok(balance) if balance < cost => {
            return JsonResponse::payment_required("Not enough credits for this transformation")
                .into_response();
        }
        Ok(_) => {}
        Err(err) => {
            error!(?err, %user_id, "failed to read credit balance");
            return JsonResponse::server_error("Failed to read credit balance").into_response();
        }
    }

    let prompt = payload
        .prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    let job = match app_state
        .job_repo
        .create_job(NewJob {
            user_id,
            project_id,
            transformation: payload.transformation,
            input_image_url: payload.image_url.trim().to_string(),
            prompt,
        })
        .await
    {
        Ok(job) => job,
        Err(err) => {
            error!(?err, %user_id, %project_id, "failed to create job");
            return JsonResponse::server_error("Failed to create job").into_response();
        }
    };

    let stored = match app_state.ai.generate(GenerationRequest::from(&job)).await {
        Ok(task_id) => app_state.job_repo.mark_processing(job.id, &task_id).await,
        Err(err) => {
            warn!(job_id = %job.id, %err, "generation request rejected");
            app_state
                .job_repo
                .fail_job(job.id, &format!("generation request failed: {err}"))
                .await
        }
    };
    let job = match stored {
        Ok(Some(updated)) => updated,
        Ok(None) => job,
        Err(err) => {
            error!(?err, job_id = %job.id, "failed to store generation handle");
            return JsonResponse::server_error("Failed to start generation").into_response();
        }
    };

    app_state.invalidation.publish(Invalidation::ProjectImages {
        user_id,
        project_id,
    });
    if job.is_pollable() {
        app_state
            .synchronizer
            .start_sync(vec![job.clone()], Some(user_id));
    }
    info!(job_id = %job.id, status = job.status.as_str(), "job submitted");

    let status = if job.status == JobStatus::Failed {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::ACCEPTED
    };
    (
        status,
        Json(json!({ "success": status == StatusCode::ACCEPTED, "job": job })),
    )
        .into_response()
}

// GET /api/jobs/{job_id}
pub async fn get_job(
    State(app_state): State<AppState>,
    auth: AuthSession,
    Path(job_id): Path<Uuid>,
) -> Response {
    match app_state.job_repo.find_job_for_user(auth.user_id, job_id).await {
        Ok(Some(job)) => Json(json!({ "success": true, "job": job })).into_response(),
        Ok(None) => JsonResponse::not_found("Job not found").into_response(),
        Err(err) => {
            error!(?err, %job_id, "failed to load job");
            JsonResponse::server_error("Failed to load job").into_response()
        }
    }
}

// GET /api/projects/{project_id}/jobs
pub async fn list_project_jobs(
    State(app_state): State<AppState>,
    auth: AuthSession,
    Path(project_id): Path<Uuid>,
) -> Response {
    match app_state
        .job_repo
        .list_jobs_for_project(auth.user_id, project_id)
        .await
    {
        Ok(jobs) => Json(json!({ "success": true, "jobs": jobs })).into_response(),
        Err(err) => {
            error!(?err, %project_id, "failed to list jobs");
            JsonResponse::server_error("Failed to list jobs").into_response()
        }
    }
}

// POST /api/jobs/sync
pub async fn start_sync(
    State(app_state): State<AppState>,
    auth: AuthSession,
    Query(params): Query<SyncParams>,
) -> Response {
    let user_id = auth.user_id;
    let jobs = match app_state.job_repo.list_pollable_jobs_for_user(user_id).await {
        Ok(jobs) => jobs,
        Err(err) => {
            error!(?err, %user_id, "failed to list in-flight jobs");
            return JsonResponse::server_error("Failed to start sync").into_response();
        }
    };
    let in_flight = jobs.len();

    let sync = &app_state.synchronizer;
    let handle = match params.interval_ms {
        Some(ms) => sync.start_sync_every(
            jobs,
            Some(user_id),
            Duration::from_millis(ms.max(MIN_CLIENT_INTERVAL_MS)),
        ),
        None => sync.start_sync(jobs, Some(user_id)),
    };

    Json(json!({
        "success": true,
        "in_flight": in_flight,
        "session_id": handle.as_ref().map(|h| h.session_id),
        "started": handle.map(|h| h.job_ids.len()).unwrap_or(0),
    }))
    .into_response()
}

// DELETE /api/jobs/sync
pub async fn stop_sync(State(app_state): State<AppState>, auth: AuthSession) -> Response {
    let stopped = app_state.synchronizer.stop_sync_for(auth.user_id);
    Json(json!({ "success": true, "stopped": stopped })).into_response()
}
