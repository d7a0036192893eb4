/*!
 * Tracing subscriber setup
 *
 * Request, correction and transfer events are emitted with `tracing`; the
 * embedding application decides where they go. Without a log file they are
 * written compactly to stdout, with one they are written to the file as JSON
 * lines.
 */

use std::fs::File;
use std::path::Path;
use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Result, StratusError};

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    let json_layer = file.map(|file| {
        fmt::layer()
            .json()
            .with_writer(file)
            .with_ansi(false)
            .with_current_span(true)
    });
    let stdout_layer = json_layer
        .is_none()
        .then(|| fmt::layer().compact().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| StratusError::Config(format!("Failed to install subscriber: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("stratus={}", config.level.to_tracing_level())))
        .map_err(|e| StratusError::Config(format!("Invalid log filter: {}", e)))
}

fn open_log_file(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| {
        StratusError::Config(format!("Cannot open log file {}: {}", path.display(), e))
    })
}

/// Route events to the test harness's captured output; safe to call from
/// every test
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stratus=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer().compact())
            .try_init();
    });
}
