// Logging for rook.
// Thin initialization helpers over the `tracing` ecosystem. The runtime emits
// structured events (worker, actor id, message type); this module only wires
// up a subscriber. Embedders that install their own subscriber can skip it.

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter};

/// Configuration for the default log subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display.
    pub level: Level,
    /// Whether to include file and line information.
    pub show_file_line: bool,
    /// Whether to include thread names and ids.
    pub show_thread_info: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...").
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            show_file_line: false,
            show_thread_info: true,
            target_filters: None,
        }
    }
}

static INIT: Once = Once::new();

/// Initialize the logging system with the given configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());
        if let Some(filters) = config.target_filters {
            for filter in filters.split(',') {
                if let Ok(directive) = filter.parse() {
                    env_filter = env_filter.add_directive(directive);
                }
            }
        }

        let fmt_layer = fmt::layer()
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let subscriber = Registry::default().with(env_filter).with(fmt_layer);
        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("error setting global tracing subscriber: {err}");
        }
    });
}

/// Initialize logging with defaults suitable for demos and small services.
pub fn init_default() {
    init(LogConfig::default());
}

/// Initialize logging for tests: warnings and errors only, minimal noise.
pub fn init_test() {
    init(LogConfig {
        level: Level::WARN,
        show_file_line: true,
        show_thread_info: false,
        target_filters: None,
    });
}

// Re-export the commonly used macros so embedders can log through one path.
pub use tracing::{debug, error, info, trace, warn};
