use axum::Json;
use axum::{extract::State, http::HeaderMap, response::IntoResponse};
use axum::{http::StatusCode, response::Response};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::credit_ledger_repository::LedgerError;
use crate::db::payment_event_repository::EventClaim;
use crate::models::payment_event::PaymentEventStatus;
use crate::responses::JsonResponse;
use crate::services::credits::LedgerOutcome;
use crate::services::invalidation::Invalidation;
use crate::services::stripe::{StripeEvent, StripeServiceError};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("event is missing {0}")]
    MissingField(&'static str),
    #[error("no credit pack matches this purchase")]
    UnknownPack,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What a dispatched event did. Used for logging only.
#[derive(Debug, PartialEq)]
pub enum EventOutcome {
    Credited { user_id: Uuid, credits: i64 },
    Refunded { user_id: Uuid, credits: i64 },
    AlreadyApplied,
    PaymentFailed,
    Ignored,
}

// Small helper: nested json lookup
fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn extract_str<'a>(val: &'a Value, path: &[&str]) -> Option<&'a str> {
    jget(val, path)?.as_str().filter(|s| !s.is_empty())
}

fn extract_i64(val: &Value, path: &[&str]) -> Option<i64> {
    let v = jget(val, path)?;
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn extract_user_id(object: &Value) -> Option<Uuid> {
    extract_str(object, &["metadata", "user_id"])
        .or_else(|| extract_str(object, &["client_reference_id"]))
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn extract_failure_message(object: &Value) -> Option<String> {
    extract_str(object, &["last_payment_error", "message"])
        .or_else(|| extract_str(object, &["failure_message"]))
        .map(str::to_string)
}

fn received() -> Response {
    Json(json!({ "received": true })).into_response()
}

/// Credits granted by a purchase: the configured pack wins over the count stamped into
/// metadata at checkout.
fn purchased_credits(state: &AppState, object: &Value) -> Result<i64, WebhookError> {
    let billing = &state.config.billing;
    if let Some(pack) = extract_str(object, &["metadata", "pack_id"]).and_then(|id| billing.pack(id)) {
        return Ok(pack.credits);
    }
    extract_i64(object, &["metadata", "credits"])
        .filter(|c| *c > 0)
        .ok_or(WebhookError::UnknownPack)
}

/// Credits to claw back for the part of a charge refunded by this event.
///
/// `amount_refunded` is cumulative, so the share already clawed back by earlier refund
/// events (`previous_attributes.amount_refunded`) is subtracted.
pub fn refunded_credits(credits: i64, amount: i64, amount_refunded: i64, previously_refunded: i64) -> i64 {
    if credits <= 0 || amount <= 0 {
        return 0;
    }
    let share = |refunded: i64| {
        if refunded >= amount {
            credits
        } else {
            credits * refunded.max(0) / amount
        }
    };
    (share(amount_refunded) - share(previously_refunded)).max(0)
}

async fn handle_checkout_completed(
    state: &AppState,
    evt: &StripeEvent,
) -> Result<EventOutcome, WebhookError> {
    let object = jget(&evt.payload, &["data", "object"]).ok_or(WebhookError::MissingField("data.object"))?;

    // Delayed payment methods complete the session before the money arrives; the
    // async_payment_succeeded event carries the credit in that case.
    if evt.r#type == "checkout.session.completed"
        && extract_str(object, &["payment_status"]) == Some("unpaid")
    {
        info!(event_id = %evt.id, "checkout completed but unpaid, waiting for async payment");
        return Ok(EventOutcome::Ignored);
    }

    let user_id = extract_user_id(object).ok_or(WebhookError::MissingField("metadata.user_id"))?;
    let credits = purchased_credits(state, object)?;
    let description = extract_str(object, &["metadata", "pack_id"])
        .and_then(|id| state.config.billing.pack(id))
        .map(|pack| format!("Purchase: {}", pack.label));

    match state
        .ledger
        .credit_purchase(user_id, &evt.id, credits, description)
        .await?
    {
        LedgerOutcome::Recorded(_) => {
            state
                .invalidation
                .publish(Invalidation::CreditBalance { user_id });
            Ok(EventOutcome::Credited { user_id, credits })
        }
        LedgerOutcome::AlreadyRecorded => Ok(EventOutcome::AlreadyApplied),
    }
}

async fn handle_payment_failed(evt: &StripeEvent) -> Result<EventOutcome, WebhookError> {
    let object = jget(&evt.payload, &["data", "object"]).unwrap_or(&Value::Null);
    let user_id = extract_user_id(object);
    let message = extract_failure_message(object);
    warn!(event_id = %evt.id, event_type = %evt.r#type, ?user_id, failure = ?message, "payment did not complete");
    Ok(EventOutcome::PaymentFailed)
}

async fn handle_charge_refunded(
    state: &AppState,
    evt: &StripeEvent,
) -> Result<EventOutcome, WebhookError> {
    let object = jget(&evt.payload, &["data", "object"]).ok_or(WebhookError::MissingField("data.object"))?;
    let user_id = extract_user_id(object).ok_or(WebhookError::MissingField("metadata.user_id"))?;
    let credits = purchased_credits(state, object)?;
    let amount = extract_i64(object, &["amount"]).ok_or(WebhookError::MissingField("amount"))?;
    let amount_refunded = extract_i64(object, &["amount_refunded"])
        .ok_or(WebhookError::MissingField("amount_refunded"))?;
    let previously_refunded =
        extract_i64(&evt.payload, &["data", "previous_attributes", "amount_refunded"]).unwrap_or(0);

    let clawback = refunded_credits(credits, amount, amount_refunded, previously_refunded);
    if clawback == 0 {
        info!(event_id = %evt.id, %user_id, "refund does not claw back any credits");
        return Ok(EventOutcome::Ignored);
    }

    let description = Some(format!(
        "Refund of {} for charge {}",
        amount_refunded - previously_refunded,
        extract_str(object, &["id"]).unwrap_or("unknown")
    ));
    match state
        .ledger
        .debit_refund(user_id, &evt.id, clawback, description)
        .await?
    {
        LedgerOutcome::Recorded(tx) => {
            if tx.balance_after < 0 {
                warn!(%user_id, balance = tx.balance_after, "refund left a negative balance");
            }
            state
                .invalidation
                .publish(Invalidation::CreditBalance { user_id });
            Ok(EventOutcome::Refunded {
                user_id,
                credits: clawback,
            })
        }
        LedgerOutcome::AlreadyRecorded => Ok(EventOutcome::AlreadyApplied),
    }
}

pub async fn dispatch_event(
    state: &AppState,
    evt: &StripeEvent,
) -> Result<EventOutcome, WebhookError> {
    match evt.r#type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            handle_checkout_completed(state, evt).await
        }
        "payment_intent.payment_failed"
        | "checkout.session.async_payment_failed"
        | "checkout.session.expired" => handle_payment_failed(evt).await,
        "charge.refunded" => handle_charge_refunded(state, evt).await,
        other => {
            info!(event_id = %evt.id, event_type = other, "unhandled stripe event acknowledged");
            Ok(EventOutcome::Ignored)
        }
    }
}

// POST /webhook/payment-events
pub async fn webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let sig = match headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        Some(s) => s,
        None => return JsonResponse::bad_request("Missing Stripe-Signature").into_response(),
    };

    let evt = match app_state.stripe.verify_webhook(&body, sig) {
        Ok(e) => e,
        Err(StripeServiceError::Webhook(err)) => {
            warn!(%err, "stripe webhook verification failed");
            return JsonResponse::bad_request("Invalid webhook signature").into_response();
        }
        // Authentic but unreadable: fail so the provider redelivers it.
        Err(err) => {
            error!(%err, "authenticated stripe webhook could not be parsed");
            return JsonResponse::server_error("Malformed event payload").into_response();
        }
    };
    let event_id = evt.id.as_str();
    let repo = &app_state.payment_event_repo;

    match repo.find_event(event_id).await {
        Ok(Some(existing)) if existing.status == PaymentEventStatus::Processed => {
            info!(event_id, "duplicate stripe event skipped");
            return received();
        }
        Ok(_) => {}
        Err(err) => {
            error!(?err, event_id, "failed to look up stripe event");
            return JsonResponse::server_error("Failed to record event").into_response();
        }
    }

    match repo.claim_event(event_id, &evt.r#type, &evt.payload).await {
        Ok(EventClaim::Claimed) => {}
        Ok(EventClaim::Retrying { attempts }) => {
            info!(event_id, attempts, "retrying stripe event");
        }
        Ok(EventClaim::AlreadyProcessed) => {
            info!(event_id, "duplicate stripe event skipped");
            return received();
        }
        Ok(EventClaim::InFlight) => {
            info!(event_id, "stripe event is being handled by a concurrent delivery");
            return received();
        }
        Err(err) => {
            error!(?err, event_id, "failed to claim stripe event");
            return JsonResponse::server_error("Failed to record event").into_response();
        }
    }

    match dispatch_event(&app_state, &evt).await {
        Ok(outcome) => {
            if let Err(err) = repo.mark_processed(event_id).await {
                error!(?err, event_id, "failed to mark stripe event processed");
                return JsonResponse::server_error("Failed to record event").into_response();
            }
            info!(event_id, event_type = %evt.r#type, ?outcome, "stripe event processed");
            received()
        }
        Err(err) => {
            let detail = err.to_string();
            error!(event_id, event_type = %evt.r#type, error = %detail, "stripe event handler failed");
            if let Err(mark_err) = repo.mark_failed(event_id, &detail).await {
                error!(?mark_err, event_id, "failed to mark stripe event failed");
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "received": false, "error": detail })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::payment_event_repository::{PaymentEventRepository, STALE_CLAIM_SECS};
    use crate::models::credit_transaction::CreditTransactionType;
    use crate::models::payment_event::PaymentEvent;
    use crate::services::stripe::signature::sign_header;
    use crate::state::test_support::{test_state, TestHarness, TEST_WEBHOOK_SECRET};
    use axum::extract::State as AxumState;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    mockall::mock! {
        EventStore {}

        #[async_trait::async_trait]
        impl PaymentEventRepository for EventStore {
            async fn find_event(&self, event_id: &str) -> Result<Option<PaymentEvent>, sqlx::Error>;
            async fn claim_event(
                &self,
                event_id: &str,
                event_type: &str,
                raw_payload: &Value,
            ) -> Result<EventClaim, sqlx::Error>;
            async fn mark_processed(&self, event_id: &str) -> Result<(), sqlx::Error>;
            async fn mark_failed(&self, event_id: &str, error_detail: &str) -> Result<(), sqlx::Error>;
        }
    }

    fn signed(body: &Value) -> (HeaderMap, axum::body::Bytes) {
        let bytes = serde_json::to_vec(body).unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_header(TEST_WEBHOOK_SECRET, now, &bytes)).unwrap(),
        );
        (headers, axum::body::Bytes::from(bytes))
    }

    async fn deliver(state: &AppState, body: &Value) -> Response {
        let (headers, bytes) = signed(body);
        webhook(AxumState(state.clone()), headers, bytes).await
    }

    fn checkout_completed(event_id: &str, user_id: Uuid, pack_id: &str) -> Value {
        json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test_1",
                "payment_status": "paid",
                "client_reference_id": user_id.to_string(),
                "metadata": { "user_id": user_id.to_string(), "pack_id": pack_id, "credits": "100" }
            } }
        })
    }

    fn purchases(harness: &TestHarness, user_id: Uuid) -> Vec<i64> {
        harness
            .db
            .transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.amount)
            .collect()
    }

    #[tokio::test]
    async fn checkout_completed_credits_once_across_redeliveries() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        let body = checkout_completed("evt_1", user_id, "agency");

        let first = deliver(&state, &body).await;
        assert_eq!(first.status(), StatusCode::OK);
        for _ in 0..3 {
            assert_eq!(deliver(&state, &body).await.status(), StatusCode::OK);
        }

        let txs = harness.db.transactions_for_event("evt_1");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, 100);
        assert_eq!(txs[0].transaction_type, CreditTransactionType::Purchase);
        let event = harness.db.payment_event("evt_1").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Processed);
        assert_eq!(event.attempts, 1);
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_without_a_record() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        let (headers, _) = signed(&checkout_completed("evt_2", user_id, "agency"));
        let tampered = serde_json::to_vec(&checkout_completed("evt_2", Uuid::new_v4(), "agency")).unwrap();

        let resp = webhook(AxumState(state), headers, axum::body::Bytes::from(tampered)).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(harness.db.payment_event("evt_2").is_none());
        assert!(harness.db.transactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let (state, harness) = test_state();
        let body = serde_json::to_vec(&checkout_completed("evt_3", Uuid::new_v4(), "agency")).unwrap();

        let resp = webhook(AxumState(state), HeaderMap::new(), axum::body::Bytes::from(body)).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(harness.db.payment_event("evt_3").is_none());
    }

    #[tokio::test]
    async fn invalid_signature_never_touches_the_event_store() {
        let (mut state, _) = test_state();
        let mut store = MockEventStore::new();
        store.expect_find_event().never();
        store.expect_claim_event().never();
        store.expect_mark_processed().never();
        store.expect_mark_failed().never();
        state.payment_event_repo = Arc::new(store);

        let body = serde_json::to_vec(&checkout_completed("evt_4", Uuid::new_v4(), "agency")).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("t=1,v1=deadbeef"));

        let resp = webhook(AxumState(state), headers, axum::body::Bytes::from(body)).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn concurrent_delivery_in_flight_returns_ok_without_dispatch() {
        let (mut state, harness) = test_state();
        let mut store = MockEventStore::new();
        store.expect_find_event().returning(|_| Ok(None));
        store
            .expect_claim_event()
            .times(1)
            .returning(|_, _, _| Ok(EventClaim::InFlight));
        store.expect_mark_processed().never();
        store.expect_mark_failed().never();
        state.payment_event_repo = Arc::new(store);
        let user_id = Uuid::new_v4();

        let resp = deliver(&state, &checkout_completed("evt_5", user_id, "agency")).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(purchases(&harness, user_id).is_empty());
    }

    #[tokio::test]
    async fn delivery_while_first_claim_is_pending_is_acknowledged_once() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        let body = checkout_completed("evt_12", user_id, "agency");
        let claim = harness
            .db
            .claim_event("evt_12", "checkout.session.completed", &body)
            .await
            .unwrap();
        assert_eq!(claim, EventClaim::Claimed);

        let resp = deliver(&state, &body).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(purchases(&harness, user_id).is_empty());
        let event = harness.db.payment_event("evt_12").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Pending);
        assert_eq!(event.attempts, 1);
    }

    #[tokio::test]
    async fn abandoned_claim_is_reclaimed_and_credited_once() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        let body = checkout_completed("evt_13", user_id, "agency");
        harness
            .db
            .claim_event("evt_13", "checkout.session.completed", &body)
            .await
            .unwrap();
        if let Some(event) = harness.db.payment_events.lock().unwrap().get_mut("evt_13") {
            event.updated_at -= time::Duration::seconds(STALE_CLAIM_SECS + 1);
        }

        let resp = deliver(&state, &body).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(deliver(&state, &body).await.status(), StatusCode::OK);

        assert_eq!(purchases(&harness, user_id), vec![100]);
        let event = harness.db.payment_event("evt_13").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Processed);
        assert_eq!(event.attempts, 2);
    }

    #[tokio::test]
    async fn authentic_but_malformed_payload_fails_without_a_record() {
        let (state, harness) = test_state();
        let body = json!({ "type": "checkout.session.completed", "data": { "object": {} } });

        let resp = deliver(&state, &body).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(harness.db.payment_events.lock().unwrap().is_empty());
        assert!(harness.db.transactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_returns_500_then_retry_succeeds() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        *harness.db.failing_appends.lock().unwrap() = 1;
        let body = checkout_completed("evt_6", user_id, "starter");

        let failed = deliver(&state, &body).await;
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let event = harness.db.payment_event("evt_6").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Failed);
        assert!(event.error_detail.is_some());

        let retried = deliver(&state, &body).await;
        assert_eq!(retried.status(), StatusCode::OK);
        let event = harness.db.payment_event("evt_6").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Processed);
        assert_eq!(event.attempts, 2);
        assert_eq!(purchases(&harness, user_id), vec![10]);
    }

    #[tokio::test]
    async fn checkout_without_user_is_recorded_as_failed() {
        let (state, harness) = test_state();
        let body = json!({
            "id": "evt_7",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_x", "metadata": { "pack_id": "starter" } } }
        });

        let resp = deliver(&state, &body).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let event = harness.db.payment_event("evt_7").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Failed);
        assert_eq!(event.error_detail.as_deref(), Some("event is missing metadata.user_id"));
    }

    #[tokio::test]
    async fn unpaid_checkout_waits_for_async_payment() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        let mut pending = checkout_completed("evt_8", user_id, "starter");
        pending["data"]["object"]["payment_status"] = json!("unpaid");

        assert_eq!(deliver(&state, &pending).await.status(), StatusCode::OK);
        assert!(purchases(&harness, user_id).is_empty());

        let mut settled = checkout_completed("evt_9", user_id, "starter");
        settled["type"] = json!("checkout.session.async_payment_succeeded");
        assert_eq!(deliver(&state, &settled).await.status(), StatusCode::OK);
        assert_eq!(purchases(&harness, user_id), vec![10]);
    }

    #[tokio::test]
    async fn payment_failed_has_no_ledger_effect() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        let body = json!({
            "id": "evt_10",
            "type": "payment_intent.payment_failed",
            "data": { "object": {
                "id": "pi_1",
                "metadata": { "user_id": user_id.to_string() },
                "last_payment_error": { "message": "Your card was declined." }
            } }
        });

        assert_eq!(deliver(&state, &body).await.status(), StatusCode::OK);
        assert!(purchases(&harness, user_id).is_empty());
        assert_eq!(
            harness.db.payment_event("evt_10").unwrap().status,
            PaymentEventStatus::Processed
        );
    }

    #[tokio::test]
    async fn unknown_events_are_acknowledged_and_recorded() {
        let (state, harness) = test_state();
        let body = json!({ "id": "evt_11", "type": "customer.created", "data": { "object": {} } });

        assert_eq!(deliver(&state, &body).await.status(), StatusCode::OK);
        let event = harness.db.payment_event("evt_11").unwrap();
        assert_eq!(event.status, PaymentEventStatus::Processed);
        assert_eq!(event.event_type, "customer.created");
    }

    #[tokio::test]
    async fn refund_claws_back_credits_and_may_overdraw() {
        let (state, harness) = test_state();
        let user_id = Uuid::new_v4();
        deliver(&state, &checkout_completed("evt_buy", user_id, "agency")).await;
        harness.db.seed_balance(user_id, -60);

        let refund = json!({
            "id": "evt_refund",
            "type": "charge.refunded",
            "data": {
                "object": {
                    "id": "ch_1",
                    "amount": 4900,
                    "amount_refunded": 4900,
                    "metadata": { "user_id": user_id.to_string(), "pack_id": "agency" }
                },
                "previous_attributes": { "amount_refunded": 0 }
            }
        });
        assert_eq!(deliver(&state, &refund).await.status(), StatusCode::OK);
        assert_eq!(deliver(&state, &refund).await.status(), StatusCode::OK);

        let txs = harness.db.transactions_for_event("evt_refund");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, -100);
        assert_eq!(txs[0].transaction_type, CreditTransactionType::Refund);
        assert_eq!(state.ledger.balance(user_id).await.unwrap(), -60);
    }

    #[test]
    fn partial_refunds_claw_back_proportionally() {
        assert_eq!(refunded_credits(100, 4900, 4900, 0), 100);
        assert_eq!(refunded_credits(100, 4900, 2450, 0), 50);
        assert_eq!(refunded_credits(100, 4900, 4900, 2450), 50);
        assert_eq!(refunded_credits(10, 1000, 50, 0), 0);
        assert_eq!(refunded_credits(10, 0, 50, 0), 0);
    }
}
