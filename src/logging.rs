//! Logger collaborator interface (spec §6): a leveled callback the core calls
//! into, with a default that forwards to the `tracing` crate so the crate is
//! useful standalone without a caller-supplied sink.

use std::sync::Arc;

/// Leveled severity, matching spec §6's `Error, Warn, Info, Debug, Trace, Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// `(level, identifier, message)` callback collaborator.
///
/// `identifier` is a short component tag (`"pool"`, `"router"`, `"retry"`, …)
/// so a caller-supplied sink can filter or route without parsing `message`.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, identifier: &str, message: &str);
}

/// Forwards every call to the `tracing` crate's leveled macros. This is the
/// default logger wired into [`crate::client::Client`] when the caller does
/// not supply one, matching the ambient logging style the rest of the corpus
/// uses for system software of this kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, identifier: &str, message: &str) {
        match level {
            LogLevel::Off => {}
            LogLevel::Error => tracing::error!(target: "resp_cluster_client", component = identifier, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "resp_cluster_client", component = identifier, "{message}"),
            LogLevel::Info => tracing::info!(target: "resp_cluster_client", component = identifier, "{message}"),
            LogLevel::Debug => tracing::debug!(target: "resp_cluster_client", component = identifier, "{message}"),
            LogLevel::Trace => tracing::trace!(target: "resp_cluster_client", component = identifier, "{message}"),
        }
    }
}

/// Discards everything; used when the caller configures `Off`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: LogLevel, _identifier: &str, _message: &str) {}
}

pub type SharedLogger = Arc<dyn Logger>;

pub fn default_logger() -> SharedLogger {
    Arc::new(TracingLogger)
}
