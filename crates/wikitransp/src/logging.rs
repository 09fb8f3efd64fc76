//! Logging initialization and configuration.
//!
//! Uses the `tracing` ecosystem for structured logging with support for
//! both human-readable and JSON output formats.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging subsystem.
///
/// Log output goes to stderr (stdout is reserved for accepted rows), and the
/// RUST_LOG environment variable overrides `level`.
pub fn init(level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Initialize logging from the `[logging]` config section.
///
/// `--verbose` raises the level to debug unless the config asks for trace.
pub fn init_from_config(
    config: &wikitransp_core::Config,
    verbose_override: bool,
    json_logs_override: bool,
) {
    let level = match config.logging.level.as_str() {
        "trace" => "trace",
        _ if verbose_override => "debug",
        level => level,
    };
    let json_format = json_logs_override || config.logging.format == "json";
    init(level, json_format);
}
