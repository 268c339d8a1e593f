use crate::domain::settings::LogSettings;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // Dropping the guards stops the background writers; keep alive until exit.
    _guards: Vec<WorkerGuard>,
}

/// Maps the configured rotation name to an appender rotation; daily otherwise.
pub fn parse_rotation(rotation: &str) -> Rotation {
    match rotation.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` wins, then the configured level, then `info`.
fn level_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let file_layer = if settings.file_logging_enabled {
        std::fs::create_dir_all(&settings.log_dir)?;
        let file_appender = RollingFileAppender::new(
            parse_rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter(settings))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging initialized (level: {}, file: {})",
        settings.level,
        settings.file_logging_enabled
    );

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotation() {
        assert_eq!(parse_rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(parse_rotation("minutely"), Rotation::MINUTELY);
        assert_eq!(parse_rotation("never"), Rotation::NEVER);
        assert_eq!(parse_rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let settings = LogSettings {
            level: "not a [valid] directive".to_string(),
            ..LogSettings::default()
        };
        // Either RUST_LOG or the fallback; never a panic.
        let _ = level_filter(&settings);
    }
}
