use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::credit_transaction::{CreditTransaction, NewCreditTransaction};
use crate::models::job::Job;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: balance is {balance}, {requested} requested")]
    InsufficientCredits { balance: i64, requested: i64 },
    #[error("a ledger entry already exists for this reference")]
    Duplicate,
    #[error("ledger storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What happened to the usage entry of a job completed through
/// [`CreditLedgerRepository::complete_job_with_usage`].
#[derive(Debug, Clone, PartialEq)]
pub enum UsageCharge {
    Charged(CreditTransaction),
    AlreadyCharged,
    /// The balance could not cover the cost; the job completed without an entry.
    Waived { balance: i64, requested: i64 },
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Append-only credit ledger. The balance is always derived from the entries.
#[async_trait]
pub trait CreditLedgerRepository: Send + Sync {
    async fn balance(&self, user_id: Uuid) -> Result<i64, sqlx::Error>;

    /// Moves an in-flight job to `completed` and appends its usage entry in the same
    /// transaction. Returns `None`, and writes nothing, when the job is already terminal.
    /// A storage error rolls back both writes.
    async fn complete_job_with_usage(
        &self,
        job_id: Uuid,
        output_url: &str,
        usage: NewCreditTransaction,
    ) -> Result<Option<(Job, UsageCharge)>, LedgerError>;

    async fn find_by_payment_event(
        &self,
        event_id: &str,
    ) -> Result<Option<CreditTransaction>, sqlx::Error>;

    /// Appends an entry and snapshots the resulting balance.
    ///
    /// Fails with [`LedgerError::Duplicate`] when the job or payment event already has an
    /// entry, and with [`LedgerError::InsufficientCredits`] when a debit other than a refund
    /// would take the balance below zero.
    async fn append(&self, entry: NewCreditTransaction)
        -> Result<CreditTransaction, LedgerError>;

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error>;
}
