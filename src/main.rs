//! # Tandem Matching Core - Entry Point
//!
//! Starts the scheduler's background reconcilers. There is no HTTP server
//! in this crate; a real deployment would embed [`tandem::Core`] behind
//! whatever transport it uses and call [`tandem::commands::Engine`]
//! directly from its request handlers.
//!
//! ## Environment Variables
//!
//! - `DATABASE_URL` - PostgreSQL connection string (required)
//! - `RUST_LOG` - Logging level (optional, defaults to `info`)
//! - `LOG_FORMAT` - Log format, either `json` or `plain` (optional, defaults to `plain`)

use std::env;

use sqlx::PgPool;
use tandem::Core;
use tandem::config::Config;
use tracing::{info, instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
#[instrument]
async fn main() {
    dotenvy::dotenv().ok(); // doesn't override existing env vars

    init_tracing();

    let db_pool = PgPool::connect(
        &env::var("DATABASE_URL").expect("Env variable `DATABASE_URL` should be set"),
    )
    .await
    .expect("Failed to connect to Postgres");

    info!("Connected to PostgreSQL database");

    let core = Core::production(db_pool, Config::from_env());
    let handles = core.start();

    info!(jobs = handles.len(), "scheduler reconcilers running");

    // The reconcilers run for the process lifetime; commands would
    // ordinarily arrive over whatever transport embeds this core. This
    // bin simply keeps the process alive until interrupted.
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }

    for handle in handles {
        handle.abort();
    }
    info!("shutting down");
}

/// Initialize tracing with environment-based configuration.
///
/// Supports both structured JSON logging and human-readable console output
/// based on environment variables.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let format_layer = match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => {
            let formatting_layer = tracing_bunyan_formatter::BunyanFormattingLayer::new(
                "tandem".into(),
                std::io::stdout,
            );
            Some(Box::new(formatting_layer) as Box<dyn tracing_subscriber::Layer<_> + Send + Sync>)
        }
        _ => {
            let formatting_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false);
            Some(Box::new(formatting_layer) as Box<dyn tracing_subscriber::Layer<_> + Send + Sync>)
        }
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(layer) = format_layer {
        registry.with(layer).init();
    } else {
        registry.init();
    }

    info!("Tracing initialized");
}
