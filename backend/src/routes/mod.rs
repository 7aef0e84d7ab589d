pub mod auth;
pub mod billing;
pub mod credits;
pub mod events;
pub mod jobs;
pub mod stripe;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::responses::JsonResponse;
use crate::state::AppState;

pub const PAYMENT_WEBHOOK_PATH: &str = "/webhook/payment-events";

/// Application routes without the outer middleware stack.
pub fn router() -> Router<AppState> {
    let job_routes = Router::new()
        .route(
            "/sync",
            post(jobs::start_sync).delete(jobs::stop_sync),
        )
        .route("/{job_id}", get(jobs::get_job));

    let project_routes = Router::new().route(
        "/{project_id}/jobs",
        post(jobs::submit_job).get(jobs::list_project_jobs),
    );

    let billing_routes = Router::new()
        .route("/packs", get(billing::list_packs))
        .route("/checkout", post(billing::create_checkout));

    Router::new()
        .route("/", get(root))
        .route(PAYMENT_WEBHOOK_PATH, post(stripe::webhook))
        .route("/api/credits", get(credits::get_credits))
        .route("/api/events", get(events::sse_invalidations))
        .nest("/api/jobs", job_routes)
        .nest("/api/projects", project_routes)
        .nest("/api/billing", billing_routes)
}

/// A simple root route.
async fn root() -> Response {
    JsonResponse::success("Renzo Immobilier API").into_response()
}
