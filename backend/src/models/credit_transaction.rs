use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreditTransactionType {
    Usage,
    Purchase,
    Refund,
    Adjustment,
}

impl CreditTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditTransactionType::Usage => "usage",
            CreditTransactionType::Purchase => "purchase",
            CreditTransactionType::Refund => "refund",
            CreditTransactionType::Adjustment => "adjustment",
        }
    }

    /// Refunds claw back credits that were already paid out, so they may overdraw.
    pub fn may_overdraw(&self) -> bool {
        matches!(self, CreditTransactionType::Refund)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub transaction_type: CreditTransactionType,
    pub related_job_id: Option<Uuid>,
    pub related_payment_event_id: Option<String>,
    pub balance_after: i64,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// What a ledger entry was caused by. At most one entry exists per job or payment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerReference {
    Job(Uuid),
    PaymentEvent(String),
    Unreferenced,
}

impl LedgerReference {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            LedgerReference::Job(id) => Some(*id),
            _ => None,
        }
    }

    pub fn payment_event_id(&self) -> Option<&str> {
        match self {
            LedgerReference::PaymentEvent(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCreditTransaction {
    pub user_id: Uuid,
    pub amount: i64,
    pub transaction_type: CreditTransactionType,
    pub reference: LedgerReference,
    pub description: Option<String>,
}
