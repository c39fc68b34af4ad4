//! Logging from Warden.

use std::fs::OpenOptions;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogTarget, LoggingConfig};

/// Launch the Warden logger.
///
/// Both `tracing` events and `log` records (bridged by the subscriber) pass
/// through the configured filter.
///
/// ## Panics
///
/// Panics if a global [`tracing`] subscriber has been set already.
pub fn launch(config: &LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::builder()
        .parse(&config.level)
        .map_err(|err| format!("invalid log filter '{}': {err}", config.level))?;

    match &config.target {
        LogTarget::Stdout => {
            // We try to determine whether to use colors in a bit more fancy
            // way than tracing does automatically (it only does `NO_COLOR`).
            let layer = FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                .with_writer(std::io::stdout);
            tracing_subscriber::registry().with(filter).with(layer).init()
        }
        LogTarget::Stderr => {
            let layer = FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).init()
        }
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("cannot open log file '{path}': {err}"))?;
            // We never emit colors to files.
            let layer = FmtLayer::new().with_ansi(false).with_writer(file);
            tracing_subscriber::registry().with(filter).with(layer).init()
        }
    }

    Ok(())
}
