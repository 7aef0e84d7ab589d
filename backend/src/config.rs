use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::models::credit_pack::CreditPack;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub audience: String,
    pub issuer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct AiSettings {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub max_attempts_per_job: u32,
    pub max_total_duration: Duration,
    pub sweep_interval: Duration,
    /// In-flight jobs older than this are failed by the sweep instead of polled again.
    pub max_job_age: Duration,
    pub sweep_batch: i64,
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub generation_credit_cost: i64,
    pub credit_packs: Vec<CreditPack>,
    pub success_url: String,
    pub cancel_url: String,
}

impl BillingSettings {
    pub fn pack(&self, pack_id: &str) -> Option<&CreditPack> {
        self.credit_packs.iter().find(|p| p.id == pack_id)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub frontend_origin: String,
    pub run_migrations: bool,
    pub jwt: JwtSettings,
    pub stripe: StripeSettings,
    pub ai: AiSettings,
    pub sync: SyncSettings,
    pub billing: BillingSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let frontend_origin = vars.required("FRONTEND_ORIGIN")?;
        let frontend = frontend_origin.trim_end_matches('/').to_string();

        let credit_packs = match vars.optional("CREDIT_PACKS") {
            Some(raw) => CreditPack::parse_list(&raw).map_err(|reason| ConfigError::Invalid {
                key: "CREDIT_PACKS",
                reason,
            })?,
            None => Vec::new(),
        };

        let generation_credit_cost: i64 = vars.parsed("GENERATION_CREDIT_COST", 1)?;
        if generation_credit_cost <= 0 {
            return Err(ConfigError::Invalid {
                key: "GENERATION_CREDIT_COST",
                reason: "must be positive".into(),
            });
        }
        let max_attempts_per_job: u32 = vars.parsed("SYNC_MAX_ATTEMPTS", 180)?;
        if max_attempts_per_job == 0 {
            return Err(ConfigError::Invalid {
                key: "SYNC_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }

        Ok(Config {
            database_url: vars.required("DATABASE_URL")?,
            bind_addr: vars.parsed("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            run_migrations: vars.flag("RUN_MIGRATIONS", true),
            jwt: JwtSettings {
                secret: vars.required("JWT_SECRET")?,
                audience: vars
                    .optional("JWT_AUDIENCE")
                    .unwrap_or_else(|| "authenticated".to_string()),
                issuer: vars.optional("JWT_ISSUER"),
            },
            stripe: StripeSettings {
                secret_key: vars.required("STRIPE_SECRET_KEY")?,
                webhook_secret: vars.required("STRIPE_WEBHOOK_SECRET")?,
                webhook_tolerance_secs: vars.parsed("STRIPE_WEBHOOK_TOLERANCE_SECS", 300)?,
            },
            ai: AiSettings {
                base_url: vars.required("AI_API_BASE_URL")?,
                api_key: vars.required("AI_API_KEY")?,
                request_timeout: Duration::from_secs(vars.parsed("HTTP_TIMEOUT_SECS", 30)?),
            },
            sync: SyncSettings {
                interval: Duration::from_millis(vars.parsed("SYNC_INTERVAL_MS", 5_000)?),
                max_attempts_per_job,
                max_total_duration: Duration::from_secs(
                    vars.parsed("SYNC_MAX_DURATION_SECS", 900)?,
                ),
                sweep_interval: Duration::from_secs(vars.parsed("SYNC_SWEEP_SECS", 60)?),
                max_job_age: Duration::from_secs(vars.parsed("SYNC_MAX_JOB_AGE_SECS", 900)?),
                sweep_batch: vars.parsed("SYNC_SWEEP_BATCH", 200)?,
            },
            billing: BillingSettings {
                generation_credit_cost,
                credit_packs,
                success_url: vars
                    .optional("CHECKOUT_SUCCESS_URL")
                    .unwrap_or_else(|| format!("{frontend}/billing?checkout=success")),
                cancel_url: vars
                    .optional("CHECKOUT_CANCEL_URL")
                    .unwrap_or_else(|| format!("{frontend}/billing?checkout=cancelled")),
            },
            frontend_origin,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.optional(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }
}
