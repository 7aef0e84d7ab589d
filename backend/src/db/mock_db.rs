use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use super::credit_ledger_repository::{CreditLedgerRepository, LedgerError, UsageCharge};
use super::job_repository::JobRepository;
use super::payment_event_repository::{EventClaim, PaymentEventRepository, STALE_CLAIM_SECS};
use crate::models::credit_transaction::{CreditTransaction, NewCreditTransaction};
use crate::models::job::{Job, JobStatus, NewJob};
use crate::models::payment_event::{PaymentEvent, PaymentEventStatus};

/// In-memory store honouring the same uniqueness and conditional-update rules as the
/// Postgres schema, so idempotency behaviour can be exercised without a database.
#[derive(Default)]
pub struct MockDb {
    pub jobs: Mutex<HashMap<Uuid, Job>>,
    pub transactions: Mutex<Vec<CreditTransaction>>,
    pub payment_events: Mutex<HashMap<String, PaymentEvent>>,
    /// Number of upcoming ledger appends that fail with a storage error.
    pub failing_appends: Mutex<usize>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_job(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn seed_balance(&self, user_id: Uuid, credits: i64) {
        let mut txs = self.transactions.lock().unwrap();
        let balance = balance_of(&txs, user_id) + credits;
        txs.push(CreditTransaction {
            id: Uuid::new_v4(),
            user_id,
            amount: credits,
            transaction_type: crate::models::credit_transaction::CreditTransactionType::Adjustment,
            related_job_id: None,
            related_payment_event_id: None,
            balance_after: balance,
            description: Some("seed".into()),
            created_at: OffsetDateTime::now_utc(),
        });
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn transactions_for_job(&self, job_id: Uuid) -> Vec<CreditTransaction> {
        self.transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.related_job_id == Some(job_id))
            .cloned()
            .collect()
    }

    pub fn transactions_for_event(&self, event_id: &str) -> Vec<CreditTransaction> {
        self.transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.related_payment_event_id.as_deref() == Some(event_id))
            .cloned()
            .collect()
    }

    pub fn payment_event(&self, event_id: &str) -> Option<PaymentEvent> {
        self.payment_events.lock().unwrap().get(event_id).cloned()
    }

    fn append_locked(
        &self,
        txs: &mut Vec<CreditTransaction>,
        entry: NewCreditTransaction,
    ) -> Result<CreditTransaction, LedgerError> {
        {
            let mut failing = self.failing_appends.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
            }
        }

        let duplicate = txs.iter().any(|t| {
            (entry.reference.job_id().is_some() && t.related_job_id == entry.reference.job_id())
                || (entry.reference.payment_event_id().is_some()
                    && t.related_payment_event_id.as_deref()
                        == entry.reference.payment_event_id())
        });
        if duplicate {
            return Err(LedgerError::Duplicate);
        }

        let balance = balance_of(txs, entry.user_id);
        let balance_after = balance + entry.amount;
        if entry.amount < 0 && balance_after < 0 && !entry.transaction_type.may_overdraw() {
            return Err(LedgerError::InsufficientCredits {
                balance,
                requested: -entry.amount,
            });
        }

        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            amount: entry.amount,
            transaction_type: entry.transaction_type,
            related_job_id: entry.reference.job_id(),
            related_payment_event_id: entry.reference.payment_event_id().map(str::to_string),
            balance_after,
            description: entry.description,
            created_at: OffsetDateTime::now_utc(),
        };
        txs.push(tx.clone());
        Ok(tx)
    }

    fn finish_job(&self, job_id: Uuid, finish: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id)?;
        if job.status.is_terminal() {
            return None;
        }
        let now = OffsetDateTime::now_utc();
        finish(job);
        job.updated_at = now;
        job.completed_at = Some(now);
        Some(job.clone())
    }
}

fn balance_of(txs: &[CreditTransaction], user_id: Uuid) -> i64 {
    txs.iter()
        .rev()
        .find(|t| t.user_id == user_id)
        .map(|t| t.balance_after)
        .unwrap_or(0)
}

#[async_trait]
impl JobRepository for MockDb {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let job = Job {
            id: Uuid::new_v4(),
            user_id: new_job.user_id,
            project_id: new_job.project_id,
            transformation: new_job.transformation,
            input_image_url: new_job.input_image_url,
            prompt: new_job.prompt,
            external_task_id: None,
            status: JobStatus::Pending,
            output_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.job(job_id))
    }

    async fn find_job_for_user(
        &self,
        user_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.job(job_id).filter(|j| j.user_id == user_id))
    }

    async fn list_jobs_for_project(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.user_id == user_id && j.project_id == project_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_pollable_jobs(
        &self,
        exclude: &[Uuid],
        limit: i64,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.is_pollable() && !exclude.contains(&j.id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_pollable_jobs_for_user(&self, user_id: Uuid) -> Result<Vec<Job>, sqlx::Error> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.user_id == user_id && j.is_pollable())
            .cloned()
            .collect())
    }

    async fn mark_processing(
        &self,
        job_id: Uuid,
        external_task_id: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.external_task_id = Some(external_task_id.to_string());
        job.updated_at = OffsetDateTime::now_utc();
        Ok(Some(job.clone()))
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        Ok(self.finish_job(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error_message.to_string());
        }))
    }
}

#[async_trait]
impl CreditLedgerRepository for MockDb {
    async fn balance(&self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        Ok(balance_of(&self.transactions.lock().unwrap(), user_id))
    }

    async fn find_by_payment_event(
        &self,
        event_id: &str,
    ) -> Result<Option<CreditTransaction>, sqlx::Error> {
        Ok(self.transactions_for_event(event_id).into_iter().next())
    }

    async fn append(
        &self,
        entry: NewCreditTransaction,
    ) -> Result<CreditTransaction, LedgerError> {
        let mut txs = self.transactions.lock().unwrap();
        self.append_locked(&mut txs, entry)
    }

    async fn complete_job_with_usage(
        &self,
        job_id: Uuid,
        output_url: &str,
        usage: NewCreditTransaction,
    ) -> Result<Option<(Job, UsageCharge)>, LedgerError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }

        let mut txs = self.transactions.lock().unwrap();
        let charge = if txs.iter().any(|t| t.related_job_id == Some(job_id)) {
            UsageCharge::AlreadyCharged
        } else {
            match self.append_locked(&mut txs, usage) {
                Ok(entry) => UsageCharge::Charged(entry),
                Err(LedgerError::InsufficientCredits { balance, requested }) => {
                    UsageCharge::Waived { balance, requested }
                }
                Err(err) => return Err(err),
            }
        };

        let now = OffsetDateTime::now_utc();
        job.status = JobStatus::Completed;
        job.output_url = Some(output_url.to_string());
        job.updated_at = now;
        job.completed_at = Some(now);
        Ok(Some((job.clone(), charge)))
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentEventRepository for MockDb {
    async fn find_event(&self, event_id: &str) -> Result<Option<PaymentEvent>, sqlx::Error> {
        Ok(self.payment_event(event_id))
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: &Value,
    ) -> Result<EventClaim, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let mut events = self.payment_events.lock().unwrap();
        match events.get_mut(event_id) {
            None => {
                events.insert(
                    event_id.to_string(),
                    PaymentEvent {
                        external_event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        status: PaymentEventStatus::Pending,
                        error_detail: None,
                        raw_payload: raw_payload.clone(),
                        attempts: 1,
                        created_at: now,
                        updated_at: now,
                        processed_at: None,
                    },
                );
                Ok(EventClaim::Claimed)
            }
            Some(event) => {
                let stale = event.status == PaymentEventStatus::Pending
                    && (now - event.updated_at).whole_seconds() > STALE_CLAIM_SECS;
                match event.status {
                    PaymentEventStatus::Processed => Ok(EventClaim::AlreadyProcessed),
                    PaymentEventStatus::Failed => {
                        event.status = PaymentEventStatus::Pending;
                        event.error_detail = None;
                        event.raw_payload = raw_payload.clone();
                        event.attempts += 1;
                        event.updated_at = now;
                        Ok(EventClaim::Retrying {
                            attempts: event.attempts,
                        })
                    }
                    PaymentEventStatus::Pending if stale => {
                        event.attempts += 1;
                        event.updated_at = now;
                        Ok(EventClaim::Retrying {
                            attempts: event.attempts,
                        })
                    }
                    PaymentEventStatus::Pending => Ok(EventClaim::InFlight),
                }
            }
        }
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), sqlx::Error> {
        if let Some(event) = self.payment_events.lock().unwrap().get_mut(event_id) {
            let now = OffsetDateTime::now_utc();
            event.status = PaymentEventStatus::Processed;
            event.error_detail = None;
            event.processed_at = Some(now);
            event.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error_detail: &str) -> Result<(), sqlx::Error> {
        if let Some(event) = self.payment_events.lock().unwrap().get_mut(event_id) {
            event.status = PaymentEventStatus::Failed;
            event.error_detail = Some(error_detail.to_string());
            event.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}
