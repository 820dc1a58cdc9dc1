//! Log subscriber setup.
//!
//! Library code logs through the `log` macros. These functions install a
//! `tracing` subscriber and bridge `log` records into it, so records emitted
//! inside `converge` and `drift` spans carry the span fields.

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

fn filter_layer(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{}' ({}), using 'info'", filter, e);
        EnvFilter::new("info")
    })
}

/// Installs a human-readable subscriber.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(filter: &str) -> bool {
    let subscriber = tracing_subscriber::registry()
        .with(filter_layer(filter))
        .with(fmt::layer().with_target(true));
    install(subscriber)
}

/// Installs a subscriber writing one JSON object per line.
pub fn init_json_logging(filter: &str) -> bool {
    let subscriber = tracing_subscriber::registry()
        .with(filter_layer(filter))
        .with(fmt::layer().json().with_target(true).flatten_event(true));
    install(subscriber)
}

fn install<S>(subscriber: S) -> bool
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("A log backend is already installed, log records are not bridged: {}", e);
    }
    tracing::debug!("Logging initialized");
    true
}
