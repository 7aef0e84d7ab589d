use async_trait::async_trait;
use serde_json::Value;

use crate::models::payment_event::PaymentEvent;

/// A `pending` claim older than this is assumed abandoned and may be taken over.
pub const STALE_CLAIM_SECS: i64 = 600;

/// Result of trying to take ownership of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// First delivery: the row was created and this request owns it.
    Claimed,
    /// An earlier attempt failed (or was abandoned); this request owns the retry.
    Retrying { attempts: i32 },
    AlreadyProcessed,
    /// Another delivery holds a live claim on the same event.
    InFlight,
}

/// Idempotency store for payment provider webhook events, keyed by the provider's event id.
#[async_trait]
pub trait PaymentEventRepository: Send + Sync {
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
