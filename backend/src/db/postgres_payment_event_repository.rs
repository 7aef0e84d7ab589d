use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::db::payment_event_repository::{EventClaim, PaymentEventRepository, STALE_CLAIM_SECS};
use crate::models::payment_event::{PaymentEvent, PaymentEventStatus};

pub struct PostgresPaymentEventRepository {
    pub pool: PgPool,
}

#[async_trait]
impl PaymentEventRepository for PostgresPaymentEventRepository {
    async fn find_event(&self, event_id: &str) -> Result<Option<PaymentEvent>, sqlx::Error> {
        sqlx::query_as::<_, PaymentEvent>(
            r#"
            SELECT external_event_id, event_type, status, error_detail, raw_payload,
                   attempts, created_at, updated_at, processed_at
            FROM payment_events
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: &Value,
    ) -> Result<EventClaim, sqlx::Error> {
        let inserted = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO payment_events (external_event_id, event_type, status, raw_payload, attempts, created_at, updated_at)
            VALUES ($1, $2, 'pending', $3, 1, now(), now())
            ON CONFLICT (external_event_id) DO NOTHING
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(raw_payload)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let retried = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE payment_events
            SET status = 'pending',
                error_detail = NULL,
                raw_payload = $2,
                attempts = attempts + 1,
                updated_at = now()
            WHERE external_event_id = $1
              AND (status = 'failed'
                   OR (status = 'pending' AND updated_at < now() - make_interval(secs => $3)))
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(raw_payload)
        .bind(STALE_CLAIM_SECS as f64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempts) = retried {
            return Ok(EventClaim::Retrying { attempts });
        }

        let status = sqlx::query_scalar::<_, PaymentEventStatus>(
            "SELECT status FROM payment_events WHERE external_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match status {
            Some(PaymentEventStatus::Processed) => EventClaim::AlreadyProcessed,
            _ => EventClaim::InFlight,
        })
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE payment_events
            SET status = 'processed', error_detail = NULL, processed_at = now(), updated_at = now()
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error_detail: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE payment_events
            SET status = 'failed', error_detail = $2, updated_at = now()
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error_detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
