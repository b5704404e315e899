//! Internal compiler error reporting.
//!
//! An ICE marks an invariant the effect pipeline itself must uphold: a
//! classification observed to be stale after a rewrite, an evidence slot
//! mutated after freezing, a pass producing structurally invalid IR. These
//! are never user errors and are never silently recovered; the `ice!`
//! macro records the structured context and, in debug builds, aborts on
//! the spot so the offending pass is caught in development.

use std::sync::atomic::{AtomicU64, Ordering};

/// Count of ICEs recorded in this process.
static ICE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Record an ICE occurrence. Called by the `ice!` macro.
pub fn record_ice(message: &str) {
    ICE_COUNT.fetch_add(1, Ordering::Relaxed);
    eprintln!("internal compiler error: {message}");
}

/// Number of internal compiler errors recorded so far.
pub fn ice_count() -> u64 {
    ICE_COUNT.load(Ordering::Relaxed)
}

/// Report an internal compiler error with structured key/value context.
///
/// In debug builds this panics immediately; in release builds it records
/// the error and lets the caller surface a fatal [`PipelineError`]
/// through the normal channel.
///
/// [`PipelineError`]: crate::opt::PipelineError
///
/// ```ignore
/// ice!("classification stale after rewrite";
///      "function" => func.name,
///      "block" => block_id);
/// ```
#[macro_export]
macro_rules! ice {
    ($msg:expr $(; $key:expr => $val:expr)* $(;)?) => {{
        let mut __ice_msg = String::from($msg);
        $(
            __ice_msg.push_str(&format!("\n  {} = {:?}", $key, $val));
        )*
        $crate::ice::record_ice(&__ice_msg);
        debug_assert!(false, "internal compiler error: {}", __ice_msg);
    }};
}
