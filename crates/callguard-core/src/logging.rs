//! Logger collaborator and tracing initialisation helpers.
//!
//! The breaker always emits structured `tracing` events. In addition, an
//! embedding application may attach a [`Logger`] to receive the
//! human-readable breaker messages ("circuit is open, request rejected",
//! state changes, operation failures) together with a JSON context map.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Structured context attached to a log message.
pub type LogContext = Map<String, Value>;

/// Sink for breaker messages.
///
/// Implementations are shared between breakers and must tolerate
/// concurrent calls. A panicking implementation is isolated: the panic is
/// caught and the breaker carries on.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str, context: &LogContext);

    /// Log without context.
    fn log_message(&self, message: &str) {
        self.log(message, &LogContext::new());
    }
}

/// [`Logger`] that forwards every message to `tracing` at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str, context: &LogContext) {
        let context = serde_json::Value::Object(context.clone());
        tracing::info!(target: "callguard", context = %context, "{message}");
    }
}

/// Fire-and-forget delivery to an optional logger.
pub(crate) fn deliver(logger: Option<&dyn Logger>, message: &str, context: &LogContext) {
    let Some(logger) = logger else { return };
    if panic::catch_unwind(AssertUnwindSafe(|| logger.log(message, context))).is_err() {
        tracing::debug!(dropped = message, "logger panicked, message dropped");
    }
}

/// Output encoding of the installed subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Subscriber settings for applications that let this crate set up `tracing`.
///
/// Breaker events (the `callguard` target and the `callguard_core` modules)
/// get their own level so an application can keep its own output quiet while
/// still seeing circuit transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for everything not matched by a more specific directive.
    #[serde(default = "default_level")]
    pub level: String,
    /// Level for breaker events.
    #[serde(default = "default_breaker_level")]
    pub breaker_level: String,
    /// Extra `target=level` pairs, applied last.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "warn".to_string()
}

fn default_breaker_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            breaker_level: default_breaker_level(),
            overrides: BTreeMap::new(),
            format: LogFormat::Text,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `"warn,callguard=info,callguard_core=info"`.
    pub fn directives(&self) -> String {
        let mut parts = vec![
            self.level.clone(),
            format!("callguard={}", self.breaker_level),
            format!("callguard_core={}", self.breaker_level),
        ];
        parts.extend(
            self.overrides
                .iter()
                .map(|(target, level)| format!("{}={level}", target.replace('-', "_"))),
        );
        parts.join(",")
    }
}

/// Install a global `tracing` subscriber for the given log config.
///
/// Unparseable directives fall back to the breaker defaults. A second call
/// leaves the installed subscriber in place and returns an error.
pub fn init_tracing(config: &LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_new(config.directives())
        .unwrap_or_else(|_| EnvFilter::new(LogConfig::default().directives()));
    let output = match config.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry().with(filter).with(output).try_init()
}
