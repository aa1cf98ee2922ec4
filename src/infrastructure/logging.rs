//! Tracing setup for the monitor binary and for C hosts.
//!
//! The configured level applies to this crate and the monitor; everything
//! else in the process logs at `warn` so an embedding host is not flooded.
//! `RUST_LOG` replaces the whole filter. Console output goes to stderr,
//! leaving stdout to the monitor's JSON report.

use crate::domain::settings::LogSettings;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Targets that follow the configured level
const OWN_TARGETS: [&str; 2] = ["wt9011_bridge", "wt9011_monitor"];

/// Flushes the file writer when dropped
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Fails if one is already installed; a C host that set up its own tracing
/// keeps it and the bridge's events go there.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&settings.level)));

    let console = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(settings.ansi_colors)
            .with_target(settings.show_target)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            // Pump and scan events run on the "wt9011-io" workers
            .with_thread_names(settings.show_thread_ids)
    });

    let mut file_writer = None;
    let file = if settings.file_logging_enabled {
        let appender = RollingFileAppender::new(
            rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_writer = Some(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(settings.show_target)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("A global subscriber is already installed: {}", e))?;

    tracing::debug!(
        "Logging at {} to{}{}",
        settings.level,
        if settings.console_logging_enabled { " stderr" } else { "" },
        if settings.file_logging_enabled { " file" } else { "" },
    );
    Ok(LoggingGuard {
        _file_writer: file_writer,
    })
}

/// `warn` globally, `level` for this crate. Unknown levels mean `info`.
fn filter_directives(level: &str) -> String {
    let level = Level::from_str(level.trim()).unwrap_or(Level::INFO);
    let level = level.as_str().to_ascii_lowercase();
    OWN_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .fold("warn".to_string(), |acc, directive| acc + "," + &directive)
}

/// Unknown names fall back to daily
fn rotation(name: &str) -> Rotation {
    match name.trim().to_ascii_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}
