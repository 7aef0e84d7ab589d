use axum::{
    extract::{Json, Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::responses::JsonResponse;
use crate::routes::auth::AuthSession;
use crate::state::AppState;

const DEFAULT_HISTORY: i64 = 50;
const MAX_HISTORY: i64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

// GET /api/credits
pub async fn get_credits(
    State(app_state): State<AppState>,
    auth: AuthSession,
    Query(params): Query<HistoryParams>,
) -> Response {
    let user_id = auth.user_id;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY);

    let balance = match app_state.ledger.balance(user_id).await {
        Ok(balance) => balance,
        Err(err) => {
            error!(%err, %user_id, "failed to read credit balance");
            return JsonResponse::server_error("Failed to load credits").into_response();
        }
    };
    match app_state.ledger.history(user_id, limit).await {
        Ok(transactions) => Json(json!({
            "success": true,
            "balance": balance,
            "transactions": transactions,
        }))
        .into_response(),
        Err(err) => {
            error!(%err, %user_id, "failed to load credit history");
            JsonResponse::server_error("Failed to load credits").into_response()
        }
    }
}
