use std::sync::atomic::{AtomicU64, Ordering};

/// Point in an engine's timeline, captured when a wait is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub start_count: u64,
    pub cancel_count: u64,
}

/// The restart and cancel counters of one engine.
///
/// Both counters only ever grow. A wait is the active one exactly when the
/// live counters still equal the snapshot it captured when it was armed.
#[derive(Debug, Default)]
pub struct VersionCounters {
    start_count: AtomicU64,
    cancel_count: AtomicU64,
}

// VersionCounters is shared between restart callers and wait tasks.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<VersionCounters>();
};

impl VersionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a restart and returns the snapshot the new wait must match.
    pub fn arm(&self) -> Snapshot {
        let start_count = self.start_count.fetch_add(1, Ordering::AcqRel) + 1;
        Snapshot {
            start_count,
            cancel_count: self.cancel_count.load(Ordering::Acquire),
        }
    }

    /// Records a cancel. Every wait armed before this call becomes stale.
    pub fn cancel(&self) -> u64 {
        self.cancel_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reads both counters.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            start_count: self.start_count.load(Ordering::Acquire),
            cancel_count: self.cancel_count.load(Ordering::Acquire),
        }
    }

    /// True when no restart or cancel happened since `snapshot` was taken.
    pub fn is_current(&self, snapshot: Snapshot) -> bool {
        self.snapshot() == snapshot
    }
}
