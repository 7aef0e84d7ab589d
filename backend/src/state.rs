use std::sync::Arc;

use crate::config::Config;
use crate::db::{
    credit_ledger_repository::CreditLedgerRepository, job_repository::JobRepository,
    payment_event_repository::PaymentEventRepository,
};
use crate::services::ai::AiProvider;
use crate::services::credits::CreditLedger;
use crate::services::invalidation::InvalidationBus;
use crate::services::stripe::StripeService;
use crate::sync::{JobStatusChecker, JobSynchronizer, SyncPolicy};
use crate::utils::jwt::JwtKeys;

#[derive(Clone)]
pub struct AppState {
    pub job_repo: Arc<dyn JobRepository>,
    pub payment_event_repo: Arc<dyn PaymentEventRepository>,
    pub ledger: CreditLedger,
    pub stripe: Arc<dyn StripeService>,
    pub ai: Arc<dyn AiProvider>,
    pub synchronizer: JobSynchronizer,
    pub invalidation: InvalidationBus,
    pub config: Arc<Config>,
    pub jwt_keys: Arc<JwtKeys>,
}

pub struct Collaborators {
    pub job_repo: Arc<dyn JobRepository>,
    pub ledger_repo: Arc<dyn CreditLedgerRepository>,
    pub payment_event_repo: Arc<dyn PaymentEventRepository>,
    pub stripe: Arc<dyn StripeService>,
    pub ai: Arc<dyn AiProvider>,
}

impl AppState {
    /// Wires the ledger, invalidation bus and synchronizer on top of the given stores
    /// and provider clients.
    pub fn assemble(config: Config, jwt_keys: JwtKeys, deps: Collaborators) -> Self {
        let invalidation = InvalidationBus::new();
        let ledger = CreditLedger::new(deps.ledger_repo);
        let checker = JobStatusChecker::new(
            deps.job_repo.clone(),
            deps.ai.clone(),
            ledger.clone(),
            invalidation.clone(),
            config.billing.generation_credit_cost,
        );
        let synchronizer =
            JobSynchronizer::new(Arc::new(checker), SyncPolicy::from_settings(&config.sync));

        AppState {
            job_repo: deps.job_repo,
            payment_event_repo: deps.payment_event_repo,
            ledger,
            stripe: deps.stripe,
            ai: deps.ai,
            synchronizer,
            invalidation,
            config: Arc::new(config),
            jwt_keys: Arc::new(jwt_keys),
        }
    }
}
