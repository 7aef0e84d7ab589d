use anyhow::Context;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use renzo_backend::config::Config;
use renzo_backend::db::{
    postgres_credit_ledger_repository::PostgresCreditLedgerRepository,
    postgres_job_repository::PostgresJobRepository,
    postgres_payment_event_repository::PostgresPaymentEventRepository,
};
use renzo_backend::responses::JsonResponse;
use renzo_backend::routes;
use renzo_backend::services::ai::LiveAiProvider;
use renzo_backend::services::stripe::LiveStripeService;
use renzo_backend::state::{AppState, Collaborators};
use renzo_backend::utils::jwt::JwtKeys;
use renzo_backend::{telemetry, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _sentry = telemetry::init_tracing()?;
    let config = Config::from_env().context("invalid configuration")?;

    let rate_limit_ms: u64 = std::env::var("RATE_LIMITER_MILLISECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        // Default: 200ms/token (~5 req/sec)
        .unwrap_or(200);
    let rate_limit_burst: u32 = std::env::var("RATE_LIMITER_BURST")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        // Default: allow short bursts during client polling
        .unwrap_or(20);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(rate_limit_ms)
            .burst_size(rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .context("invalid rate limiter settings")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pg_pool = establish_connection(&config.database_url).await?;
    if config.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pg_pool)
            .await
            .context("failed to run migrations")?;
        info!("database migrations applied");
    }

    let jwt_keys =
        JwtKeys::from_secret(&config.jwt.secret).context("JWT_SECRET is not usable")?;
    let stripe = LiveStripeService::from_settings(&config.stripe);
    let ai = LiveAiProvider::from_settings(&config.ai).context("failed to build AI client")?;
    let bind_addr = config.bind_addr;
    let cors = CorsLayer::new()
        .allow_origin(
            config
                .frontend_origin
                .parse::<HeaderValue>()
                .context("FRONTEND_ORIGIN is not a valid header value")?,
        )
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let state = AppState::assemble(
        config,
        jwt_keys,
        Collaborators {
            job_repo: Arc::new(PostgresJobRepository {
                pool: pg_pool.clone(),
            }),
            ledger_repo: Arc::new(PostgresCreditLedgerRepository {
                pool: pg_pool.clone(),
            }),
            payment_event_repo: Arc::new(PostgresPaymentEventRepository {
                pool: pg_pool.clone(),
            }),
            stripe: Arc::new(stripe),
            ai: Arc::new(ai),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = worker::start_background_workers(state.clone(), shutdown_rx);
    let synchronizer = state.synchronizer.clone();

    let app = routes::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(cors);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("listening on http://{}", bind_addr);
    axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let stopped = synchronizer.stop_all();
    if let Err(err) = sweeper.await {
        warn!(?err, "sweep worker did not stop cleanly");
    }
    info!(stopped_sessions = stopped, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("successfully connected to the database");
    Ok(pool)
}
