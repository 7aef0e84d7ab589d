use axum::{
    extract::{Json, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::responses::JsonResponse;
use crate::routes::auth::AuthSession;
use crate::services::stripe::{CheckoutLineItem, CreateCheckoutSessionRequest};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub pack_id: String,
}

// GET /api/billing/packs
pub async fn list_packs(State(app_state): State<AppState>) -> Response {
    Json(json!({
        "success": true,
        "packs": app_state.config.billing.credit_packs,
    }))
    .into_response()
}

// POST /api/billing/checkout
pub async fn create_checkout(
    State(app_state): State<AppState>,
    auth: AuthSession,
    Json(payload): Json<CheckoutRequest>,
) -> Response {
    let billing = &app_state.config.billing;
    let Some(pack) = billing.pack(payload.pack_id.trim()) else {
        return JsonResponse::bad_request("Unknown credit pack").into_response();
    };
    let user_id = auth.user_id;

    let metadata = BTreeMap::from([
        ("user_id".to_string(), user_id.to_string()),
        ("pack_id".to_string(), pack.id.clone()),
        ("credits".to_string(), pack.credits.to_string()),
    ]);
    let request = CreateCheckoutSessionRequest {
        success_url: billing.success_url.clone(),
        cancel_url: billing.cancel_url.clone(),
        line_items: vec![CheckoutLineItem {
            price: pack.price_id.clone(),
            quantity: 1,
        }],
        client_reference_id: Some(user_id.to_string()),
        customer_email: auth.claims.email.clone(),
        metadata,
    };

    match app_state.stripe.create_checkout_session(request).await {
        Ok(session) => {
            info!(%user_id, pack_id = %pack.id, session_id = %session.id, "checkout session created");
            Json(json!({
                "success": true,
                "session_id": session.id,
                "url": session.url,
            }))
            .into_response()
        }
        Err(err) => {
            error!(%err, %user_id, "failed to create checkout session");
            JsonResponse::bad_gateway("Failed to start checkout").into_response()
        }
    }
}
