use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::db::credit_ledger_repository::{
    is_unique_violation, CreditLedgerRepository, LedgerError, UsageCharge,
};
use crate::db::postgres_job_repository::JOB_COLUMNS;
use crate::models::credit_transaction::{CreditTransaction, NewCreditTransaction};
use crate::models::job::Job;

const TRANSACTION_COLUMNS: &str = "id, user_id, amount, type, related_job_id, \
     related_payment_event_id, balance_after, description, created_at";

pub struct PostgresCreditLedgerRepository {
    pub pool: PgPool,
}

#[async_trait]
impl CreditLedgerRepository for PostgresCreditLedgerRepository {
    async fn balance(&self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(
                (SELECT balance_after FROM credit_transactions
                 WHERE user_id = $1 ORDER BY seq DESC LIMIT 1),
                0
            )
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }

    async fn find_by_payment_event(
        &self,
        event_id: &str,
    ) -> Result<Option<CreditTransaction>, sqlx::Error> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE related_payment_event_id = $1"
        );
        sqlx::query_as::<_, CreditTransaction>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn append(
        &self,
        entry: NewCreditTransaction,
    ) -> Result<CreditTransaction, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let inserted = append_entry(&mut *tx, entry).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn complete_job_with_usage(
        &self,
        job_id: Uuid,
        output_url: &str,
        usage: NewCreditTransaction,
    ) -> Result<Option<(Job, UsageCharge)>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // The row lock taken here makes concurrent completions of the same job queue up
        // and then match nothing.
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'completed', output_url = $2, updated_at = now(), completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let Some(job) = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(output_url)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM credit_transactions WHERE related_job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let charge = if existing.is_some() {
            UsageCharge::AlreadyCharged
        } else {
            match append_entry(&mut *tx, usage).await {
                Ok(entry) => UsageCharge::Charged(entry),
                // Rejected before the insert, so the transaction is still usable.
                Err(LedgerError::InsufficientCredits { balance, requested }) => {
                    UsageCharge::Waived { balance, requested }
                }
                Err(err) => return Err(err),
            }
        };

        tx.commit().await?;
        Ok(Some((job, charge)))
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY seq DESC
            LIMIT $2
            "#
        );
        sqlx::query_as::<_, CreditTransaction>(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }
}

/// Appends one entry inside the caller's transaction, holding a per-user advisory lock
/// so balance_after snapshots never interleave.
async fn append_entry(
    conn: &mut PgConnection,
    entry: NewCreditTransaction,
) -> Result<CreditTransaction, LedgerError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(entry.user_id.to_string())
        .execute(&mut *conn)
        .await?;

    let balance = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(
            (SELECT balance_after FROM credit_transactions
             WHERE user_id = $1 ORDER BY seq DESC LIMIT 1),
            0
        )
        "#,
    )
    .bind(entry.user_id)
    .fetch_one(&mut *conn)
    .await?;

    let balance_after = balance + entry.amount;
    if entry.amount < 0 && balance_after < 0 && !entry.transaction_type.may_overdraw() {
        return Err(LedgerError::InsufficientCredits {
            balance,
            requested: -entry.amount,
        });
    }

    let sql = format!(
        r#"
        INSERT INTO credit_transactions
            (user_id, amount, type, related_job_id, related_payment_event_id, balance_after, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        RETURNING {TRANSACTION_COLUMNS}
        "#
    );
    sqlx::query_as::<_, CreditTransaction>(&sql)
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.transaction_type)
        .bind(entry.reference.job_id())
        .bind(entry.reference.payment_event_id())
        .bind(balance_after)
        .bind(entry.description.as_deref())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                LedgerError::Duplicate
            } else {
                LedgerError::Database(err)
            }
        })
}
