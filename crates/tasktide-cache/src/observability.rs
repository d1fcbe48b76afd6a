// Tracing initialization with a configurable and reloadable log level.
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

/// Handle for changing the active log filter after initialization.
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// Apply a new logging level at runtime.
    pub fn apply_logging_level(&self, level: &str) {
        if let Err(e) = self.inner.modify(|f| *f = EnvFilter::new(level)) {
            tracing::warn!(error = %e, level, "failed to apply logging level");
        }
    }
}

pub fn init_tracing() -> LogLevelHandle {
    init_tracing_with_level("info")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. If a subscriber is already installed
/// the returned handle still works but only affects the discarded layer.
pub fn init_tracing_with_level(level: &str) -> LogLevelHandle {
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init();

    LogLevelHandle { inner: handle }
}
