use std::time::Duration;

/// Context-level configuration.
///
/// Controls request timeouts, the shutdown grace period, load shedding and
/// background task intervals.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Name of the context, used in logs and as a label.
    pub name: String,
    /// Timeout applied to InOut requests that do not set their own.
    pub default_request_timeout_ms: u64,
    /// How long `stop()` waits for in-flight exchanges before aborting them.
    pub shutdown_grace_period_ms: u64,
    /// Maximum number of exchanges routed concurrently before load shedding.
    pub max_inflight_exchanges: u32,
    /// Interval at which expired callback requests are swept.
    pub correlation_sweep_interval_ms: u64,
    /// Capacity of each in-process queue created by the default `queue` component.
    pub queue_capacity: usize,
}

impl ContextConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    #[must_use]
    pub fn correlation_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.correlation_sweep_interval_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: "mediator".to_string(),
            default_request_timeout_ms: 20_000,
            shutdown_grace_period_ms: 10_000,
            max_inflight_exchanges: 10_000,
            correlation_sweep_interval_ms: 250,
            queue_capacity: 1024,
        }
    }
}

/// Output format of the `fmt` logging layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human readable.
    Pretty,
    /// Single line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Logging configuration consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
