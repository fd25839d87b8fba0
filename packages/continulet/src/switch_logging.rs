//! Compile-time gated trace logging for the switch protocol.

/// Emit protocol trace logs only when the `switch_debug_logs` Cargo feature is
/// enabled.
///
/// With the feature disabled (default), this macro compiles to a no-op while
/// still type-checking format arguments.
#[macro_export]
macro_rules! switch_debug_log {
    ($($arg:tt)*) => {{
        #[cfg(feature = "switch_debug_logs")]
        {
            log::trace!($($arg)*);
        }
        #[cfg(not(feature = "switch_debug_logs"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
