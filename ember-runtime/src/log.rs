//! Logging Infrastructure
//!
//! Structured logging for the Ember runtime: log levels, key-value
//! fields, and plain or JSON output. The runtime cannot assume a host
//! logging framework, so this is self-contained and cheap when disabled
//! (a single atomic load).
//!
//! # Example
//!
//! ```rust,ignore
//! use ember_runtime::log::{self, LogLevel};
//!
//! log::info("context pool initialized");
//!
//! log::builder(LogLevel::Warn)
//!     .message("context budget nearly exhausted")
//!     .field("live", 4090)
//!     .field("max", 4096)
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a level from a string (case-insensitive).
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "off" | "none" => Some(LogLevel::Off),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// Minimum level that will be emitted. Defaults to Info.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
/// Output format flag: 0 = plain, 1 = JSON.
static LOG_FORMAT: AtomicU8 = AtomicU8::new(0);

/// Set the global minimum log level.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set the global output format.
pub fn set_format(format: LogFormat) {
    LOG_FORMAT.store(matches!(format, LogFormat::Json) as u8, Ordering::Relaxed);
}

/// Get the current output format.
pub fn format() -> LogFormat {
    if LOG_FORMAT.load(Ordering::Relaxed) == 1 {
        LogFormat::Json
    } else {
        LogFormat::Plain
    }
}

/// Whether a record at `level` would be emitted.
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level >= self::level()
}

/// A structured field value.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Uint(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}
impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}
impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Uint(v as u64)
    }
}
impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}
impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}
impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Builder for a structured log record.
#[derive(Debug)]
pub struct LogBuilder {
    level: LogLevel,
    message: String,
    fields: Vec<(&'static str, FieldValue)>,
}

impl LogBuilder {
    /// Start a record at the given level.
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            message: String::new(),
            fields: Vec::new(),
        }
    }

    /// Set the record message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach a key-value field.
    pub fn field(mut self, key: &'static str, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    /// Emit the record if the level is enabled.
    pub fn emit(self) {
        if !enabled(self.level) {
            return;
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let line = match format() {
            LogFormat::Plain => {
                let mut line = format!("[{}] {} {}", timestamp, self.level, self.message);
                for (key, value) in &self.fields {
                    line.push_str(&format!(" {key}={value}"));
                }
                line
            }
            LogFormat::Json => {
                let mut line = format!(
                    "{{\"ts\":{},\"level\":\"{}\",\"msg\":\"{}\"",
                    timestamp,
                    self.level,
                    escape_json(&self.message)
                );
                for (key, value) in &self.fields {
                    match value {
                        FieldValue::Str(s) => {
                            line.push_str(&format!(",\"{key}\":\"{}\"", escape_json(s)));
                        }
                        other => line.push_str(&format!(",\"{key}\":{other}")),
                    }
                }
                line.push('}');
                line
            }
        };

        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(handle, "{line}");
    }
}

fn escape_json(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Start a builder at the given level.
pub fn builder(level: LogLevel) -> LogBuilder {
    LogBuilder::new(level)
}

/// Emit a trace message.
pub fn trace(message: impl Into<String>) {
    LogBuilder::new(LogLevel::Trace).message(message).emit();
}

/// Emit a debug message.
pub fn debug(message: impl Into<String>) {
    LogBuilder::new(LogLevel::Debug).message(message).emit();
}

/// Emit an info message.
pub fn info(message: impl Into<String>) {
    LogBuilder::new(LogLevel::Info).message(message).emit();
}

/// Emit a warning.
pub fn warn(message: impl Into<String>) {
    LogBuilder::new(LogLevel::Warn).message(message).emit();
}

/// Emit an error message.
pub fn error(message: impl Into<String>) {
    LogBuilder::new(LogLevel::Error).message(message).emit();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_level_roundtrip() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Int(-3).to_string(), "-3");
        assert_eq!(FieldValue::Bool(true).to_string(), "true");
        assert_eq!(FieldValue::Str("x".to_string()).to_string(), "x");
    }

    #[test]
    fn test_escape_json() {
        assert_eq!(escape_json("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn test_builder_collects_fields() {
        let record = LogBuilder::new(LogLevel::Info)
            .message("hello")
            .field("n", 3usize)
            .field("flag", true);
        assert_eq!(record.fields.len(), 2);
        assert_eq!(record.message, "hello");
    }
}
