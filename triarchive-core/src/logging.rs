//! Logging bootstrap: an `EnvFilter`-driven `tracing-subscriber` registry
//! with a daily-rolling file layer, mirroring the original daemon's
//! `TimedRotatingFileHandler` at midnight.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::GlobalConfig;

/// Initializes the global `tracing` subscriber. `TRIARCHIVE_LOG` takes
/// precedence over `RUST_LOG`, which takes precedence over the
/// configured `log_level`.
pub fn init_logging(config: &GlobalConfig) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = std::env::var("TRIARCHIVE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| config.log_level.clone());
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));

    std::fs::create_dir_all(&config.logging_folder)?;
    let file_appender = tracing_appender::rolling::daily(&config.logging_folder, &config.logging_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(guard)
}
