//! Application entry point for the `canopy-telemetry` service.
//!
//! This binary orchestrates the full startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Spawning the alert evaluation loop and the session reaper
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Serving until Ctrl-C, then stopping the workers between ticks
//!
//! # Environment Variables
//! See [`canopy_telemetry::config::load_from_env`] for the service settings.
//! - `TELEMETRY_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `TELEMETRY_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, io::IsTerminal, sync::Arc};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use canopy_telemetry::{
    config, routes, schema,
    store::PgStore,
    workers, LogNotifier, Normalizer, Notifier, SystemClock, WebhookNotifier,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", cfg.masked_db_url());

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| {
            anyhow::anyhow!("Failed to connect to database '{}': {}", cfg.masked_db_url(), e)
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let notifier: Arc<dyn Notifier> = match &cfg.event_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), cfg.store_timeout())?),
        None => Arc::new(LogNotifier),
    };

    let state = routes::AppState::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(SystemClock),
        notifier,
        Normalizer::new(cfg.future_skew()),
        cfg.engine_settings(),
    );

    // Background workers stop between ticks once the token is cancelled
    let shutdown = CancellationToken::new();
    let evaluation = tokio::spawn(workers::evaluation_loop(
        state.engine.clone(),
        std::time::Duration::from_secs(cfg.eval_interval_secs),
        shutdown.child_token(),
    ));
    let reaper = tokio::spawn(workers::reaper_loop(
        state.sessions.clone(),
        std::time::Duration::from_secs(cfg.reaper_interval_secs),
        cfg.session_stale(),
        shutdown.child_token(),
    ));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(state);

    tracing::info!("Listening on {}", cfg.bind_addr);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, waiting for workers");
    shutdown.cancel();
    let (evaluation, reaper) = tokio::join!(evaluation, reaper);
    for (name, joined) in [("evaluation", evaluation), ("reaper", reaper)] {
        if let Err(e) = joined {
            tracing::error!("{} worker did not stop cleanly: {}", name, e);
        }
    }

    pool.close().await;
    Ok(())
}

// ---

async fn shutdown_signal() {
    // ---
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `TELEMETRY_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `TELEMETRY_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("TELEMETRY_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to TELEMETRY_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("TELEMETRY_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
