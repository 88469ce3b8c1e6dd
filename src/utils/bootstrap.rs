//! Bootstrap utilities for orderbus binaries.
//!
//! Shared initialization code for the producer and every consumer service.

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};
use crate::lifecycle::shutdown_signal;

/// Initialize tracing with the ORDERBUS_LOG environment variable.
///
/// Defaults to "info" level if ORDERBUS_LOG is not set. Setting
/// ORDERBUS_LOG_FORMAT=json switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Spawn a task that flips the returned flag to `true` on SIGINT/SIGTERM.
pub fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Termination signal received, draining");
        let _ = tx.send(true);
    });
    rx
}
