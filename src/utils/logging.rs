use std::sync::{Once, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    registry, EnvFilter, Layer,
};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Keeps the background file writer alive for the life of the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Initialize the tracing system with the given configuration
///
/// Safe to call more than once; only the first call installs a subscriber.
///
/// # Example
/// ```
/// use scs_transport::config::LoggingConfig;
/// use scs_transport::utils::logging::init_logging;
/// use tracing::Level;
///
/// let config = LoggingConfig {
///     app_name: "my-service".to_string(),
///     log_level: Level::DEBUG,
///     ..Default::default()
/// };
///
/// init_logging(&config);
/// ```
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{},{app_name}={level}",
                config.log_level,
                app_name = config.app_name,
                level = config.log_level
            ))
        });

        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(log_dir) = &config.log_dir {
            let file_appender = rolling::daily(log_dir, format!("{}.log", config.app_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = FILE_GUARD.set(guard);

            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE);
            layers.push(if config.json_format {
                file_layer.json().boxed()
            } else {
                file_layer.boxed()
            });
        }

        // Console output is the fallback when nothing else is configured
        if config.log_to_console || config.log_dir.is_none() {
            let stdout_layer = fmt::layer().with_writer(std::io::stdout);
            layers.push(if config.json_format {
                stdout_layer.json().boxed()
            } else {
                stdout_layer.with_ansi(true).boxed()
            });
        }

        let installed = registry().with(layers).with(filter).try_init().is_ok();
        if installed {
            tracing::info!("Logging initialized at {} level", config.log_level);
        }
    });
}

/// Setup default logging configuration for quick startup
pub fn setup_default_logging() {
    init_logging(&LoggingConfig::default());
}
