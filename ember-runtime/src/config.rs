//! Runtime Configuration
//!
//! Configuration for the Ember runtime: execution-context budgets, stack
//! sizing, and logging. Built either programmatically through
//! [`RuntimeConfigBuilder`] or from `EMBER_*` environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `EMBER_MAX_CONTEXTS` | Max live suspended execution contexts | 4096 |
//! | `EMBER_STACK_INITIAL` | Initial context stack size (bytes) | 8192 |
//! | `EMBER_STACK_MAX` | Max context stack size (bytes) | 1048576 |
//! | `EMBER_LOG_LEVEL` | Minimum log level | info |
//! | `EMBER_LOG_FORMAT` | `plain` or `json` | plain |

use thiserror::Error;

use crate::log::{LogFormat, LogLevel};

/// Configuration error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The context budget must allow at least one context.
    #[error("max_contexts must be at least 1")]
    ZeroContexts,

    /// Stack sizes must be positive and ordered.
    #[error("invalid stack sizes: initial {initial} must be > 0 and <= max {max}")]
    InvalidStackSizes {
        /// Configured initial size.
        initial: usize,
        /// Configured maximum size.
        max: usize,
    },

    /// An environment variable failed to parse.
    #[error("invalid value for {var}: {value}")]
    InvalidEnvValue {
        /// The variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Execution-context limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Maximum number of live suspended execution contexts.
    pub max_contexts: usize,
    /// Initial context stack size in bytes.
    pub initial_stack_size: usize,
    /// Maximum context stack size in bytes.
    pub max_stack_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_contexts: 4096,
            initial_stack_size: 8 * 1024,  // 8 KB
            max_stack_size: 1024 * 1024,   // 1 MB
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// Minimum level emitted.
    pub level: Option<LogLevel>,
    /// Output format.
    pub format: LogFormat,
}

/// Full runtime configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeConfig {
    /// Execution-context limits.
    pub context: ContextConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `EMBER_*` environment variables, using
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();

        if let Some(v) = env_var("EMBER_MAX_CONTEXTS") {
            let parsed = v.parse().map_err(|_| ConfigError::InvalidEnvValue {
                var: "EMBER_MAX_CONTEXTS",
                value: v,
            })?;
            builder = builder.max_contexts(parsed);
        }
        if let Some(v) = env_var("EMBER_STACK_INITIAL") {
            let parsed = v.parse().map_err(|_| ConfigError::InvalidEnvValue {
                var: "EMBER_STACK_INITIAL",
                value: v,
            })?;
            builder = builder.initial_stack_size(parsed);
        }
        if let Some(v) = env_var("EMBER_STACK_MAX") {
            let parsed = v.parse().map_err(|_| ConfigError::InvalidEnvValue {
                var: "EMBER_STACK_MAX",
                value: v,
            })?;
            builder = builder.max_stack_size(parsed);
        }
        if let Some(v) = env_var("EMBER_LOG_LEVEL") {
            let level = LogLevel::parse(&v).ok_or(ConfigError::InvalidEnvValue {
                var: "EMBER_LOG_LEVEL",
                value: v,
            })?;
            builder = builder.log_level(level);
        }
        if let Some(v) = env_var("EMBER_LOG_FORMAT") {
            let format = match v.to_ascii_lowercase().as_str() {
                "plain" => LogFormat::Plain,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::InvalidEnvValue {
                        var: "EMBER_LOG_FORMAT",
                        value: v,
                    })
                }
            };
            builder = builder.log_format(format);
        }

        builder.build()
    }

    /// Apply the logging section to the global logger.
    pub fn apply_log_config(&self) {
        if let Some(level) = self.log.level {
            crate::log::set_level(level);
        }
        crate::log::set_format(self.log.format);
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    context: ContextConfig,
    log: LogConfig,
}

impl RuntimeConfigBuilder {
    /// Set the maximum number of live contexts.
    pub fn max_contexts(mut self, max: usize) -> Self {
        self.context.max_contexts = max;
        self
    }

    /// Set the initial context stack size.
    pub fn initial_stack_size(mut self, size: usize) -> Self {
        self.context.initial_stack_size = size;
        self
    }

    /// Set the maximum context stack size.
    pub fn max_stack_size(mut self, size: usize) -> Self {
        self.context.max_stack_size = size;
        self
    }

    /// Set the minimum log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log.level = Some(level);
        self
    }

    /// Set the log output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log.format = format;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        if self.context.max_contexts == 0 {
            return Err(ConfigError::ZeroContexts);
        }
        if self.context.initial_stack_size == 0
            || self.context.initial_stack_size > self.context.max_stack_size
        {
            return Err(ConfigError::InvalidStackSizes {
                initial: self.context.initial_stack_size,
                max: self.context.max_stack_size,
            });
        }
        Ok(RuntimeConfig {
            context: self.context,
            log: self.log,
        })
    }
}
