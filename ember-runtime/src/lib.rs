//! # Ember Runtime Library
//!
//! Runtime support for Ember's effect-handler execution core:
//!
//! - **Evidence Vectors**: per-computation handler lookup, O(1) for
//!   static slots
//! - **Execution Contexts**: lazily-allocated stacks plus handler frame
//!   chains for suspended computations
//! - **Continuations**: owned one-shot resumption with explicit
//!   multi-shot cloning
//! - **State Cells**: poll-based re-entry for async-specialized
//!   functions
//! - **FFI Barrier**: foreign-frame capture guard and callback
//!   conversion slots
//!
//! The runtime is scheduler-agnostic: it defines suspension points and
//! continuation objects; who runs them, and in what order, is the
//! embedding scheduler's business.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      EMBER RUNTIME                          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────┐  │
//! │  │   Evidence   │  │   Contexts    │  │ Continuations  │  │
//! │  │(evidence.rs) │  │ (context.rs)  │  │(continuation.rs)│  │
//! │  └──────────────┘  └───────────────┘  └────────────────┘  │
//! │         │                  │                  │            │
//! │         └──────────────────┼──────────────────┘            │
//! │                            │                               │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────┐  │
//! │  │  State Cells │  │  FFI Barrier  │  │ Config / Log   │  │
//! │  │  (poll.rs)   │  │   (ffi.rs)    │  │(config.rs,log.rs)│ │
//! │  └──────────────┘  └───────────────┘  └────────────────┘  │
//! │                                                             │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod continuation;
pub mod evidence;
pub mod ffi;
pub mod log;
pub mod poll;

// Re-exports
pub use config::{ConfigError, ContextConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use context::{
    ContextError, ContextId, ContextPool, ContextState, ExecutionContext, FrameArena, FrameIndex,
    HandlerFrame, TeardownHook,
};
pub use continuation::{
    register_continuation, resume_ref, take_continuation, Continuation, ContinuationId,
    ContinuationRef, ResumeError,
};
pub use evidence::{EffectTag, EvidenceEntry, EvidenceVector, HandlerRef};
pub use ffi::{ForeignFrameGuard, ResultSlot};
pub use poll::{run_to_completion, Poll, StateCell};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Install a runtime configuration and apply its logging section.
///
/// The first installation wins; later calls return `false` and change
/// nothing, matching the one-initialization model of embedding code.
pub fn init_with_config(config: RuntimeConfig) -> bool {
    config.apply_log_config();
    RUNTIME_CONFIG.set(config).is_ok()
}

/// Install configuration from `EMBER_*` environment variables.
pub fn init_from_env() -> Result<bool, ConfigError> {
    Ok(init_with_config(RuntimeConfig::from_env()?))
}

/// The installed runtime configuration, if any.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config_round_trip() {
        // Whether or not another test installed a config first, the
        // accessor and installer must agree.
        let config = RuntimeConfig::default();
        let installed = init_with_config(config.clone());
        if installed {
            assert_eq!(runtime_config(), Some(&config));
        } else {
            assert!(runtime_config().is_some());
        }
    }
}
