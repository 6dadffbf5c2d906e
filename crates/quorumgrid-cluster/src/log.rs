//! Bridge from the database engine's leveled log callback into `tracing`.

use tracing::{debug, error, info, warn};

/// Severity reported by the database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map the engine's numeric level; unknown codes are treated as errors.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Receives engine diagnostics.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards engine diagnostics to `tracing` under `quorumgrid::dqlite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "quorumgrid::dqlite", "{message}"),
            LogLevel::Info => info!(target: "quorumgrid::dqlite", "{message}"),
            LogLevel::Warn => warn!(target: "quorumgrid::dqlite", "{message}"),
            LogLevel::Error => error!(target: "quorumgrid::dqlite", "{message}"),
        }
    }
}
