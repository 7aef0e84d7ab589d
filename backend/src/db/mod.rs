pub mod credit_ledger_repository;
pub mod job_repository;
#[cfg(test)]
pub mod mock_db;
pub mod payment_event_repository;
pub mod postgres_credit_ledger_repository;
pub mod postgres_job_repository;
pub mod postgres_payment_event_repository;
