use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use kernel_protocol::LogLevel;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Target of the one-per-request summary events; the JSON log file keeps
/// only these.
pub const REQUEST_TARGET: &str = "request";

/// Logging capability handed to every worker at construction time.
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn tracing() -> Self {
        Logger(Box::new(TracingLogger))
    }

    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg);
    }

    pub fn debug(&self, context: &str, msg: &str) {
        self.log(LogLevel::Debug, context, msg);
    }

    pub fn info(&self, context: &str, msg: &str) {
        self.log(LogLevel::Info, context, msg);
    }

    pub fn warn(&self, context: &str, msg: &str) {
        self.log(LogLevel::Warn, context, msg);
    }

    pub fn error(&self, context: &str, msg: &str) {
        self.log(LogLevel::Error, context, msg);
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Forwards every record to `tracing`, with the worker name as a field.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub context: String,
    pub msg: String,
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|r| r.level == level && r.msg.contains(needle))
    }

    pub fn logger(&self) -> Logger {
        Logger(Box::new(self.clone()))
    }
}

impl LoggerType for MemoryLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        let record = LogRecord {
            level,
            context: context.to_string(),
            msg: msg.to_string(),
        };
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MemoryLogger({} records)", self.records().len())
    }
}

/// Install the global subscriber.
///
/// Human readable output goes to stderr (stdout carries protocol traffic in the
/// line transport). When `log_file` is set, a daily rolling plain-text file and
/// a JSON file for [`REQUEST_TARGET`] events are written next to it.
pub fn init_tracing(log_level: &str, log_file: Option<PathBuf>) -> Result<Logger> {
    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level `{log_level}`"))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true);

    match log_file {
        Some(log_file) => {
            let dir = log_file
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = log_file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "kernel_relay.log".to_string());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;

            let txt_appender = RollingFileAppender::new(Rotation::DAILY, &dir, &file_name);
            let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

            let json_appender =
                RollingFileAppender::new(Rotation::DAILY, &dir, format!("{file_name}.json"));
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{REQUEST_TARGET}=info")));

            Registry::default()
                .with(env_filter)
                .with(stderr_layer)
                .with(txt_layer)
                .with(json_layer)
                .try_init()
                .context("tracing subscriber already installed")?;
        }
        None => {
            Registry::default()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .context("tracing subscriber already installed")?;
        }
    }

    Ok(Logger::tracing())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_shares_records_between_clones() {
        let memory = MemoryLogger::new();
        let logger = memory.logger();
        let cloned = logger.clone();

        logger.warn("comm", "channel `x` not open");
        cloned.info("relay", "done");

        let records = memory.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].context, "comm");
        assert!(memory.contains(LogLevel::Warn, "not open"));
        assert!(!memory.contains(LogLevel::Error, "not open"));
    }

    #[test]
    fn test_logger_debug_uses_box_description() {
        assert_eq!(format!("{:?}", Logger::tracing()), "TracingLogger");
    }
}
