use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::credit_ledger_repository::{CreditLedgerRepository, LedgerError, UsageCharge};
use crate::models::credit_transaction::{
    CreditTransaction, CreditTransactionType, LedgerReference, NewCreditTransaction,
};
use crate::models::job::Job;

/// Outcome of an idempotent ledger write.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    Recorded(CreditTransaction),
    /// The referenced job or payment event already has its entry.
    AlreadyRecorded,
}

#[derive(Clone)]
pub struct CreditLedger {
    repo: Arc<dyn CreditLedgerRepository>,
}

impl CreditLedger {
    pub fn new(repo: Arc<dyn CreditLedgerRepository>) -> Self {
        Self { repo }
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self.repo.balance(user_id).await?)
    }

    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self.repo.list_for_user(user_id, limit).await?)
    }

    /// Completes an in-flight job and charges it in the same write. A job that is already
    /// terminal yields `None` and is never charged, so a late or repeated check cannot
    /// bill a failed job or bill a job twice.
    pub async fn complete_job(
        &self,
        job: &Job,
        output_url: &str,
        cost: i64,
    ) -> Result<Option<(Job, UsageCharge)>, LedgerError> {
        let usage = NewCreditTransaction {
            user_id: job.user_id,
            amount: -cost,
            transaction_type: CreditTransactionType::Usage,
            reference: LedgerReference::Job(job.id),
            description: Some(format!("{} generation", job.transformation.as_str())),
        };
        let completed = self
            .repo
            .complete_job_with_usage(job.id, output_url, usage)
            .await?;
        match &completed {
            Some((_, UsageCharge::Charged(tx))) => {
                info!(job_id = %job.id, user_id = %job.user_id, amount = tx.amount, balance_after = tx.balance_after, "usage recorded");
            }
            Some((_, UsageCharge::Waived { balance, requested })) => {
                warn!(job_id = %job.id, user_id = %job.user_id, balance, requested, "credits exhausted, job delivered without debit");
            }
            Some((_, UsageCharge::AlreadyCharged)) | None => {}
        }
        Ok(completed)
    }

    pub async fn credit_purchase(
        &self,
        user_id: Uuid,
        event_id: &str,
        credits: i64,
        description: Option<String>,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.record_for_event(user_id, event_id, credits, CreditTransactionType::Purchase, description)
            .await
    }

    /// Claws back refunded credits. The balance may go negative.
    pub async fn debit_refund(
        &self,
        user_id: Uuid,
        event_id: &str,
        credits: i64,
        description: Option<String>,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.record_for_event(user_id, event_id, -credits, CreditTransactionType::Refund, description)
            .await
    }

    async fn record_for_event(
        &self,
        user_id: Uuid,
        event_id: &str,
        amount: i64,
        transaction_type: CreditTransactionType,
        description: Option<String>,
    ) -> Result<LedgerOutcome, LedgerError> {
        if self.repo.find_by_payment_event(event_id).await?.is_some() {
            return Ok(LedgerOutcome::AlreadyRecorded);
        }
        self.record(NewCreditTransaction {
            user_id,
            amount,
            transaction_type,
            reference: LedgerReference::PaymentEvent(event_id.to_string()),
            description,
        })
        .await
    }

    async fn record(&self, entry: NewCreditTransaction) -> Result<LedgerOutcome, LedgerError> {
        let user_id = entry.user_id;
        let kind = entry.transaction_type;
        match self.repo.append(entry).await {
            Ok(tx) => {
                info!(%user_id, amount = tx.amount, balance_after = tx.balance_after, kind = kind.as_str(), "ledger entry recorded");
                Ok(LedgerOutcome::Recorded(tx))
            }
            Err(LedgerError::Duplicate) => {
                warn!(%user_id, kind = kind.as_str(), "ledger entry already recorded by a concurrent writer");
                Ok(LedgerOutcome::AlreadyRecorded)
            }
            Err(err) => Err(err),
        }
    }
}
