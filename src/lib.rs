//! Bookstream Market Data Collector Library
//!
//! A multi-exchange order book collector built with Rust: per-symbol book
//! maintenance with exchange-specific sequence validation, OKX checksum
//! verification, and NATS publication.

pub mod cli;
pub mod collector;
pub mod config;
pub mod exchange;
pub mod metrics;
pub mod normalizer;
pub mod orderbook;
pub mod publisher;
pub mod snapshot;
pub mod websocket;

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

/// Application result type for consistent error handling
pub type AppResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Initialize tracing with an optional rolling file layer.
///
/// The returned guard must be held for the lifetime of the process so the
/// non-blocking writer flushes on exit.
pub fn init_logging(level: &str, file_path: Option<&str>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("bookstream={}", level).into());

    match file_path {
        Some(path) => {
            let path = Path::new(path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "bookstream.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            Ok(None)
        }
    }
}
