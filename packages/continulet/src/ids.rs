//! Identifier types.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a continuation object.
///
/// Used for logs and `Debug` output only; continuation equality is reference
/// identity, never id comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContId(pub u64);

static CONT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ContId {
    /// Create a fresh unique ContId.
    pub fn fresh() -> Self {
        ContId(CONT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        ContId(value)
    }
}

impl std::fmt::Display for ContId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
