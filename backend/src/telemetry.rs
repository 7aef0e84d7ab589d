use std::env;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` selects levels (default `info`),
/// `LOG_FORMAT=json` switches to structured output, and `SENTRY_DSN` enables error
/// reporting. Keep the returned guard alive for the lifetime of the process.
pub fn init_tracing() -> anyhow::Result<Option<sentry::ClientInitGuard>> {
    let sentry_guard = env::var("SENTRY_DSN")
        .ok()
        .filter(|dsn| !dsn.trim().is_empty())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    environment: env::var("APP_ENV").ok().map(Into::into),
                    ..Default::default()
                },
            ))
        });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().json().with_current_span(false)), None)
    } else {
        (None, Some(fmt::layer()))
    };
    let sentry_layer = sentry_guard.as_ref().map(|_| sentry_tracing::layer());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sentry_layer)
        .try_init()?;

    Ok(sentry_guard)
}
