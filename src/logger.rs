use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a log level from a string, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `log_mode`.
pub fn init_logger(log_mode: &str) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        let level = LogLevel::parse(log_mode).unwrap_or_default();
        EnvFilter::new(format!("asura={}", level.as_str()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Record a peer connection event
    pub fn connection(side: &str, peer: &str, event: &str) {
        info!(side = side, peer = peer, event = event, "Connection");
    }

    /// Record a plugin hook registration
    pub fn hook_registered(plugin: &str, key: &str) {
        info!(plugin = plugin, packet = key, "Packet hooked");
    }
}
