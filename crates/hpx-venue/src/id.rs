//! Correlation identifiers and their allocator.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Caller-chosen integer embedded in a request and echoed in its reply.
///
/// Unique for the lifetime of one [`IdAllocator`], reconnects included.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Get the raw integer.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic, lock-free source of correlation ids starting at 0.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator whose first id is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next id. Never returns the same value twice.
    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether `id` has already been handed out by this allocator.
    pub fn was_issued(&self, id: CorrelationId) -> bool {
        id.0 < self.next.load(Ordering::Relaxed)
    }
}
