//! Deferred logger bridge.
//!
//! The bus engine asks for loggers while it is being constructed, which is
//! before the function host hands over its logging infrastructure. A
//! [`LoggerContext`] hands out [`DeferredLogger`]s immediately; each one
//! queues its entries until a sink is attached and then writes straight to
//! the sink.
//!
//! Attaching is single-assignment. The queued entries are drained under the
//! logger's lock before the sink is published, so an entry written while the
//! attach is in progress is either drained or written directly, never both.
//!
//! # Example
//!
//! ```rust
//! use hostbus::logging::{LoggerContext, TracingSink};
//! use std::sync::Arc;
//!
//! let context = LoggerContext::new();
//! let log = context.get_logger("orders");
//! log.info("queued until a sink exists");
//!
//! context.attach_sink(Arc::new(TracingSink));
//! log.info("written directly");
//! ```

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

// ---------------------------------------------------------------------------
// Levels and entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// A log call captured before (or after) a sink was attached.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredLogEntry {
    pub level: LogLevel,
    /// The message, or the format template for formatted entries.
    pub message: String,
    pub error: Option<String>,
    /// Arguments substituted into `{}` placeholders of `message`.
    pub args: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
}

impl DeferredLogEntry {
    fn new(level: LogLevel, message: String) -> Self {
        Self {
            level,
            message,
            error: None,
            args: None,
            timestamp: Utc::now(),
        }
    }

    /// The message with format arguments substituted.
    pub fn render(&self) -> String {
        let Some(args) = &self.args else {
            return self.message.clone();
        };
        let mut out = String::with_capacity(self.message.len());
        let mut args = args.iter();
        let mut rest = self.message.as_str();
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str("{}"),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        out
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// The real logging destination supplied by the host.
pub trait LogSink: Send + Sync {
    fn is_enabled(&self, level: LogLevel) -> bool {
        let _ = level;
        true
    }

    fn log(&self, logger: &str, entry: &DeferredLogEntry);
}

/// Creates a sink per logger name.
pub trait LogSinkFactory: Send + Sync {
    fn create(&self, logger: &str) -> Arc<dyn LogSink>;
}

struct SharedSinkFactory(Arc<dyn LogSink>);

impl LogSinkFactory for SharedSinkFactory {
    fn create(&self, _logger: &str) -> Arc<dyn LogSink> {
        self.0.clone()
    }
}

/// Forwards entries to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn is_enabled(&self, level: LogLevel) -> bool {
        match level {
            LogLevel::Debug => tracing::enabled!(tracing::Level::DEBUG),
            LogLevel::Info => tracing::enabled!(tracing::Level::INFO),
            LogLevel::Warn => tracing::enabled!(tracing::Level::WARN),
            LogLevel::Error | LogLevel::Fatal => tracing::enabled!(tracing::Level::ERROR),
        }
    }

    fn log(&self, logger: &str, entry: &DeferredLogEntry) {
        let message = entry.render();
        let error = entry.error.as_deref().unwrap_or_default();
        match entry.level {
            LogLevel::Debug => tracing::debug!(logger, error, "{}", message),
            LogLevel::Info => tracing::info!(logger, error, "{}", message),
            LogLevel::Warn => tracing::warn!(logger, error, "{}", message),
            LogLevel::Error => tracing::error!(logger, error, "{}", message),
            LogLevel::Fatal => tracing::error!(logger, error, fatal = true, "{}", message),
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred logger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    messages: VecDeque<DeferredLogEntry>,
    with_error: VecDeque<DeferredLogEntry>,
    formatted: VecDeque<DeferredLogEntry>,
}

impl Pending {
    fn push(&mut self, entry: DeferredLogEntry) {
        if entry.args.is_some() {
            self.formatted.push_back(entry);
        } else if entry.error.is_some() {
            self.with_error.push_back(entry);
        } else {
            self.messages.push_back(entry);
        }
    }

    fn len(&self) -> usize {
        self.messages.len() + self.with_error.len() + self.formatted.len()
    }
}

/// A named logger that queues entries until a sink is attached.
pub struct DeferredLogger {
    name: String,
    sink: OnceLock<Arc<dyn LogSink>>,
    pending: Mutex<Pending>,
}

macro_rules! level_methods {
    ($level:expr, $plain:ident, $with_error:ident, $format:ident, $enabled:ident) => {
        pub fn $plain(&self, message: impl Into<String>) {
            self.log($level, message);
        }

        pub fn $with_error(&self, message: impl Into<String>, error: &dyn fmt::Display) {
            self.log_with_error($level, message, error);
        }

        pub fn $format(&self, template: &str, args: &[&dyn fmt::Display]) {
            self.log_format($level, template, args);
        }

        pub fn $enabled(&self) -> bool {
            self.is_enabled($level)
        }
    };
}

impl DeferredLogger {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: OnceLock::new(),
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_attached(&self) -> bool {
        self.sink.get().is_some()
    }

    /// Number of queued entries.
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    /// `true` until attached; afterwards the sink decides.
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.sink.get().map_or(true, |sink| sink.is_enabled(level))
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.write(DeferredLogEntry::new(level, message.into()));
    }

    pub fn log_with_error(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        error: &dyn fmt::Display,
    ) {
        let mut entry = DeferredLogEntry::new(level, message.into());
        entry.error = Some(error.to_string());
        self.write(entry);
    }

    pub fn log_format(&self, level: LogLevel, template: &str, args: &[&dyn fmt::Display]) {
        let mut entry = DeferredLogEntry::new(level, template.to_string());
        entry.args = Some(args.iter().map(ToString::to_string).collect());
        self.write(entry);
    }

    level_methods!(LogLevel::Debug, debug, debug_with_error, debug_format, is_debug_enabled);
    level_methods!(LogLevel::Info, info, info_with_error, info_format, is_info_enabled);
    level_methods!(LogLevel::Warn, warn, warn_with_error, warn_format, is_warn_enabled);
    level_methods!(LogLevel::Error, error, error_with_error, error_format, is_error_enabled);
    level_methods!(LogLevel::Fatal, fatal, fatal_with_error, fatal_format, is_fatal_enabled);

    /// Attach the sink and flush queued entries into it.
    ///
    /// Returns `false` if a sink was already attached; `sink` is then ignored.
    pub fn attach(&self, sink: Arc<dyn LogSink>) -> bool {
        let mut pending = self.lock_pending();
        if self.sink.get().is_some() {
            return false;
        }

        let drained = std::mem::take(&mut *pending);
        for entry in drained
            .messages
            .iter()
            .chain(drained.with_error.iter())
            .chain(drained.formatted.iter())
        {
            if sink.is_enabled(entry.level) {
                sink.log(&self.name, entry);
            }
        }

        // Published while still holding the lock: writers blocked on it
        // observe the sink once they get in.
        let _ = self.sink.set(sink);
        true
    }

    fn write(&self, entry: DeferredLogEntry) {
        if let Some(sink) = self.sink.get() {
            emit(sink.as_ref(), &self.name, &entry);
            return;
        }

        let mut pending = self.lock_pending();
        match self.sink.get() {
            Some(sink) => {
                drop(pending);
                emit(sink.as_ref(), &self.name, &entry);
            }
            None => pending.push(entry),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn emit(sink: &dyn LogSink, name: &str, entry: &DeferredLogEntry) {
    if sink.is_enabled(entry.level) {
        sink.log(name, entry);
    }
}

impl fmt::Debug for DeferredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredLogger")
            .field("name", &self.name)
            .field("attached", &self.is_attached())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Logger context
// ---------------------------------------------------------------------------

/// Process-wide registry of deferred loggers.
///
/// Create one at startup, share it with every component that logs, and
/// attach the host's logging once it becomes available. Re-attaching is
/// rejected: concurrent invocations racing to install different sinks would
/// otherwise make the destination depend on scheduling.
#[derive(Default)]
pub struct LoggerContext {
    loggers: Mutex<HashMap<String, Arc<DeferredLogger>>>,
    factory: OnceLock<Arc<dyn LogSinkFactory>>,
}

impl LoggerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the logger named `name`. Always succeeds.
    pub fn get_logger(&self, name: &str) -> Arc<DeferredLogger> {
        let mut loggers = self.lock_loggers();
        let logger = loggers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DeferredLogger::new(name)))
            .clone();
        drop(loggers);

        if let Some(factory) = self.factory.get() {
            if !logger.is_attached() {
                logger.attach(factory.create(name));
            }
        }
        logger
    }

    pub fn is_attached(&self) -> bool {
        self.factory.get().is_some()
    }

    /// Attach a single sink shared by every logger.
    pub fn attach_sink(&self, sink: Arc<dyn LogSink>) -> bool {
        self.attach_factory(Arc::new(SharedSinkFactory(sink)))
    }

    /// Attach a factory creating one sink per logger.
    ///
    /// Returns `false` and keeps the existing destination if one was
    /// already attached.
    pub fn attach_factory(&self, factory: Arc<dyn LogSinkFactory>) -> bool {
        if self.install(factory) {
            return true;
        }
        tracing::warn!("logging is already attached; ignoring new log destination");
        self.get_logger(env!("CARGO_PKG_NAME"))
            .warn("logging is already attached; ignoring new log destination");
        false
    }

    /// Attach `sink` only if nothing is attached yet. Losing the race is
    /// silent.
    pub fn try_attach_sink(&self, sink: Arc<dyn LogSink>) -> bool {
        self.install(Arc::new(SharedSinkFactory(sink)))
    }

    fn install(&self, factory: Arc<dyn LogSinkFactory>) -> bool {
        if self.factory.set(factory).is_err() {
            return false;
        }

        let Some(factory) = self.factory.get() else {
            return false;
        };
        let loggers: Vec<Arc<DeferredLogger>> = self.lock_loggers().values().cloned().collect();
        for logger in loggers {
            logger.attach(factory.create(logger.name()));
        }
        true
    }

    fn lock_loggers(&self) -> MutexGuard<'_, HashMap<String, Arc<DeferredLogger>>> {
        self.loggers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LoggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerContext")
            .field("loggers", &self.lock_loggers().len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        lines: Mutex<Vec<(String, LogLevel, String)>>,
        min: Option<LogLevel>,
    }

    impl LogSink for Collect {
        fn is_enabled(&self, level: LogLevel) -> bool {
            self.min.map_or(true, |min| level >= min)
        }

        fn log(&self, logger: &str, entry: &DeferredLogEntry) {
            self.lines
                .lock()
                .unwrap()
                .push((logger.to_string(), entry.level, entry.render()));
        }
    }

    impl Collect {
        fn messages(&self) -> Vec<String> {
            self.lines.lock().unwrap().iter().map(|l| l.2.clone()).collect()
        }
    }

    #[test]
    fn test_entries_are_queued_then_flushed_in_order() {
        let context = LoggerContext::new();
        let log = context.get_logger("a");
        log.info("one");
        log.warn("two");
        log.debug("three");
        assert_eq!(log.pending(), 3);

        let sink = Arc::new(Collect::default());
        assert!(context.attach_sink(sink.clone()));

        assert_eq!(sink.messages(), vec!["one", "two", "three"]);
        assert_eq!(log.pending(), 0);

        log.error("four");
        assert_eq!(sink.messages().len(), 4);
    }

    #[test]
    fn test_buckets_flush_by_call_shape() {
        let log = DeferredLogger::new("shapes");
        log.info_format("{} of {}", &[&1, &2]);
        log.warn_with_error("failed", &"disk full");
        log.info("plain");

        let sink = Arc::new(Collect::default());
        log.attach(sink.clone());
        assert_eq!(sink.messages(), vec!["plain", "failed", "1 of 2"]);
    }

    #[test]
    fn test_enabled_checks() {
        let log = DeferredLogger::new("levels");
        assert!(log.is_debug_enabled());
        assert!(log.is_fatal_enabled());

        log.attach(Arc::new(Collect {
            min: Some(LogLevel::Warn),
            ..Collect::default()
        }));
        assert!(!log.is_debug_enabled());
        assert!(!log.is_info_enabled());
        assert!(log.is_warn_enabled());
        assert!(log.is_error_enabled());
    }

    #[test]
    fn test_second_attach_is_rejected() {
        let context = LoggerContext::new();
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());

        assert!(context.attach_sink(first.clone()));
        assert!(!context.attach_sink(second.clone()));

        context.get_logger("late").info("hello");
        assert!(first.messages().contains(&"hello".to_string()));
        assert!(second.messages().is_empty());
        assert!(first
            .messages()
            .iter()
            .any(|m| m.contains("already attached")));
    }

    #[test]
    fn test_loggers_created_after_attach_are_attached() {
        let context = LoggerContext::new();
        let sink = Arc::new(Collect::default());
        context.attach_sink(sink.clone());

        let log = context.get_logger("new");
        assert!(log.is_attached());
        log.fatal_with_error("crash", &"oom");
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines[0].0, "new");
        assert_eq!(lines[0].1, LogLevel::Fatal);
    }

    #[test]
    fn test_render_with_missing_args() {
        let mut entry = DeferredLogEntry::new(LogLevel::Info, "{} and {}".into());
        entry.args = Some(vec!["a".into()]);
        assert_eq!(entry.render(), "a and {}");
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let context = Arc::new(LoggerContext::new());
        let sink = Arc::new(Collect::default());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let context = context.clone();
                std::thread::spawn(move || {
                    let log = context.get_logger("race");
                    for i in 0..250 {
                        log.info(format!("{}-{}", t, i));
                    }
                })
            })
            .collect();

        context.attach_sink(sink.clone());
        for w in writers {
            w.join().unwrap();
        }

        let messages = sink.messages();
        assert_eq!(messages.len(), 1000);
        for t in 0..4 {
            let mine: Vec<_> = messages
                .iter()
                .filter(|m| m.starts_with(&format!("{}-", t)))
                .map(|m| m.split('-').nth(1).unwrap().parse::<u32>().unwrap())
                .collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
