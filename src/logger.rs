//! Logging through a host-supplied interface, with a colored console default.
//!
//! This module provides:
//! - [`Logger`], the only sink the orchestrator writes to
//! - [`ConsoleLogger`] for formatted terminal output with colored prefixes
//! - [`MemoryLogger`] / [`NullLogger`] for embedding and tests
//! - `debug!` / `info!` / `warn!` / `error!` macros that take the logger first
//! - `WatchStatus` for single-line watch mode status messages
//!
//! # Example
//!
//! ```ignore
//! info!(logger, "reload"; "reloaded {} in {}ms", name, ms);
//! debug!(logger, "watch"; "raw notify: {:?}", event.kind);
//! ```

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::{
    io::{Write, stdout},
    sync::{Arc, LazyLock},
    sync::atomic::{AtomicBool, Ordering},
};

// ============================================================================
// Logger interface
// ============================================================================

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging interface used by every component of the orchestrator.
///
/// `module` is a short prefix (`watch`, `reload`, `loader`, ...) and
/// `message` is already formatted.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, module: &str, message: &str);

    /// Whether debug lines are wanted. The `debug!` macro skips formatting otherwise.
    fn is_debug(&self) -> bool {
        false
    }

    fn debug(&self, module: &str, message: &str) {
        if self.is_debug() {
            self.log(Level::Debug, module, message);
        }
    }

    fn info(&self, module: &str, message: &str) {
        self.log(Level::Info, module, message);
    }

    fn warn(&self, module: &str, message: &str) {
        self.log(Level::Warn, module, message);
    }

    fn error(&self, module: &str, message: &str) {
        self.log(Level::Error, module, message);
    }
}

// ============================================================================
// Log Macros
// ============================================================================

/// Log a debug message (only formatted when the logger wants debug output)
///
/// # Usage
/// ```ignore
/// debug!(logger, "module"; "debug info: {}", value);
/// ```
#[macro_export]
macro_rules! debug {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::logger::Logger as _;
        let logger = &$logger;
        if logger.is_debug() {
            logger.log($crate::logger::Level::Debug, $module, &format!($($arg)*))
        }
    }};
}

/// Log an informational message
#[macro_export]
macro_rules! info {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::logger::Logger as _;
        (&$logger).log($crate::logger::Level::Info, $module, &format!($($arg)*))
    }};
}

/// Log a warning (recoverable failure)
#[macro_export]
macro_rules! warn {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::logger::Logger as _;
        (&$logger).log($crate::logger::Level::Warn, $module, &format!($($arg)*))
    }};
}

/// Log an error
#[macro_export]
macro_rules! error {
    ($logger:expr, $module:expr; $($arg:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::logger::Logger as _;
        (&$logger).log($crate::logger::Level::Error, $module, &format!($($arg)*))
    }};
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, level: Level, module: &str, message: &str) {
        (**self).log(level, module, message);
    }

    fn is_debug(&self) -> bool {
        (**self).is_debug()
    }
}

impl<L: Logger + ?Sized> Logger for &L {
    fn log(&self, level: Level, module: &str, message: &str) {
        (**self).log(level, module, message);
    }

    fn is_debug(&self) -> bool {
        (**self).is_debug()
    }
}

// ============================================================================
// Console Logger
// ============================================================================

/// Terminal logger with colored `[module]` prefixes.
pub struct ConsoleLogger {
    verbose: AtomicBool,
}

impl ConsoleLogger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose: AtomicBool::new(verbose),
        }
    }

    /// Toggle debug output at runtime.
    pub fn set_verbose(&self, v: bool) {
        self.verbose.store(v, Ordering::SeqCst);
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, level: Level, module: &str, message: &str) {
        let module_lower = module.to_ascii_lowercase();
        let prefix = colorize_prefix(module, &module_lower, level);

        let mut stdout = stdout().lock();
        execute!(stdout, Clear(ClearType::UntilNewLine)).ok();

        let line = match level {
            Level::Debug => format!("{prefix} {}", message.dimmed()),
            Level::Warn => format!("{prefix} {}", message.yellow()),
            Level::Error => format!("{prefix} {}", message.red()),
            Level::Info => format!("{prefix} {message}"),
        };
        writeln!(stdout, "{line}").ok();
        stdout.flush().ok();
    }

    fn is_debug(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }
}

/// Apply color to a module prefix based on module type
#[inline]
fn colorize_prefix(module: &str, module_lower: &str, level: Level) -> String {
    let prefix = format!("[{module}]");
    if level == Level::Error {
        return prefix.bright_red().bold().to_string();
    }
    match module_lower {
        "hmr" => prefix.bright_blue().bold().to_string(),
        "watch" => prefix.bright_green().bold().to_string(),
        "reload" => prefix.bright_magenta().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}

// ============================================================================
// Memory / Null Loggers
// ============================================================================

/// Captures log lines in memory.
#[derive(Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<(Level, String, String)>>,
    debug: bool,
}

impl MemoryLogger {
    pub fn new(debug: bool) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            debug,
        }
    }

    /// All captured `(level, module, message)` lines.
    pub fn lines(&self) -> Vec<(Level, String, String)> {
        self.lines.lock().clone()
    }

    /// Captured lines at or above `level`.
    pub fn at_least(&self, level: Level) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(l, _, _)| *l >= level)
            .map(|(_, _, m)| m.clone())
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: Level, module: &str, message: &str) {
        self.lines
            .lock()
            .push((level, module.to_string(), message.to_string()));
    }

    fn is_debug(&self) -> bool {
        self.debug
    }
}

/// Discards everything.
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _module: &str, _message: &str) {}
}

// ============================================================================
// Watch Status (single-line status with overwrite)
// ============================================================================

/// Get current time formatted as HH:MM:SS (UTC)
fn now() -> String {
    use std::time::SystemTime;
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let hours = (secs / 3600) % 24;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Single-line status display for watch mode
///
/// Displays status messages that overwrite the previous output,
/// keeping the terminal clean.
pub struct WatchStatus {
    /// Lines of previous output to clear
    last_lines: usize,
}

static WATCH_STATUS: LazyLock<Mutex<WatchStatus>> =
    LazyLock::new(|| Mutex::new(WatchStatus::new()));

impl WatchStatus {
    pub const fn new() -> Self {
        Self { last_lines: 0 }
    }

    /// Display success message (✓ prefix, green).
    pub fn success(&mut self, message: &str) {
        self.display(format!("{}", "✓".green()), message);
    }

    /// Display error message (✗ prefix, red) with optional detail.
    pub fn error(&mut self, summary: &str, detail: &str) {
        let message = if detail.is_empty() {
            summary.to_string()
        } else {
            format!("{summary}\n{detail}")
        };
        self.display(format!("{}", "✗".red()), &message);
    }

    /// Display warning message (⚠ prefix, yellow).
    pub fn warning(&mut self, detail: &str) {
        self.display(format!("{}", "⚠".yellow()), detail);
    }

    fn display(&mut self, symbol: String, message: &str) {
        let mut stdout = stdout().lock();

        if self.last_lines > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let lines = self.last_lines as u16;
            execute!(stdout, cursor::MoveUp(lines)).ok();
            execute!(stdout, Clear(ClearType::FromCursorDown)).ok();
        }

        let timestamp = format!("[{}]", now()).dimmed().to_string();
        writeln!(stdout, "{timestamp} {symbol} {message}").ok();
        stdout.flush().ok();

        self.last_lines = Self::line_count(message);
    }

    fn line_count(message: &str) -> usize {
        message.matches('\n').count() + 1
    }
}

/// Global watch status: success
pub fn status_success(message: &str) {
    WATCH_STATUS.lock().success(message);
}

/// Global watch status: error
pub fn status_error(summary: &str, detail: &str) {
    WATCH_STATUS.lock().error(summary, detail);
}

/// Global watch status: warning
pub fn status_warning(detail: &str) {
    WATCH_STATUS.lock().warning(detail);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_status_new() {
        let status = WatchStatus::new();
        assert_eq!(status.last_lines, 0);
    }

    #[test]
    fn test_watch_status_line_count_multiline() {
        let message = "failed: plugins/a.mod\nexpected `=`\n  --> line 5";
        assert_eq!(WatchStatus::line_count(message), 3);
    }

    #[test]
    fn test_memory_logger_filters_by_level() {
        let logger = Arc::new(MemoryLogger::new(false));
        debug!(logger, "watch"; "not formatted {}", 1);
        info!(logger, "hmr"; "ready");
        warn!(logger, "watch"; "lost root {}", "/tmp/x");
        error!(logger, "reload"; "failed {}", "a.mod");

        assert_eq!(logger.lines().len(), 3);
        assert_eq!(
            logger.at_least(Level::Warn),
            vec!["lost root /tmp/x".to_string(), "failed a.mod".to_string()]
        );
    }

    #[test]
    fn test_debug_macro_respects_flag() {
        let logger = Arc::new(MemoryLogger::new(true));
        debug!(logger, "watch"; "event {}", "a.mod");
        assert_eq!(logger.lines()[0].0, Level::Debug);
    }

    #[test]
    fn test_dyn_logger_through_macros() {
        let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new(true));
        debug!(logger, "watch"; "via dyn");
        info!(logger, "watch"; "via dyn");
    }
}
