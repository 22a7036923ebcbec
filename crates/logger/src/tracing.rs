use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    initialize_tracing(LevelFilter::INFO);
}

/// Initialize tracing from the numeric `log-level` option.
///
/// Levels follow 0=TRACE 1=DEBUG 2=INFO 3=WARN 4=ERROR; 5 (fatal) and
/// 6 (panic) collapse onto ERROR since fatal conditions abort the
/// process anyway. Returns `None` for anything outside 0..=6 so the
/// caller can treat it as a startup error.
pub fn init_tracing_with_level(level: u8) -> Option<LevelFilter> {
    let filter = level_from_int(level)?;
    initialize_tracing(filter);
    Some(filter)
}

pub fn level_from_int(level: u8) -> Option<LevelFilter> {
    match level {
        0 => Some(LevelFilter::TRACE),
        1 => Some(LevelFilter::DEBUG),
        2 => Some(LevelFilter::INFO),
        3 => Some(LevelFilter::WARN),
        4..=6 => Some(LevelFilter::ERROR),
        _ => None,
    }
}

fn initialize_tracing(level: LevelFilter) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT")
        .inspect_err(|error| {
            warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
        })
        .unwrap_or_default();

    let log_layer = match log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        _ => tracing_subscriber::fmt::layer().compact().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}
