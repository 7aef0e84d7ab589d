pub mod credit_pack;
pub mod credit_transaction;
pub mod job;
pub mod payment_event;
