use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::{EpochOutcome, EpochRecord};
use super::signal::CompletionSignal;

/// Records whether `cancel` was called while this epoch was the current one.
#[derive(Debug, Default)]
pub struct CancellationLatch {
    tripped: AtomicBool,
}

impl CancellationLatch {
    /// Trips the latch. Returns `true` on the first trip.
    pub fn trip(&self) -> bool {
        !self.tripped.swap(true, Ordering::AcqRel)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// One cycle from idle→running through settlement or cancellation.
#[derive(Debug)]
pub struct Epoch {
    id: Uuid,
    started_at: DateTime<Utc>,
    restarts: AtomicU64,
    finalized: AtomicUsize,
    latch: CancellationLatch,
    signal: CompletionSignal,
}

impl Epoch {
    /// A new, running epoch with a pending completion signal.
    pub fn begin() -> Self {
        Self::with_signal(CompletionSignal::pending())
    }

    /// The stand-in epoch of an engine that has never been restarted.
    pub fn idle() -> Self {
        Self::with_signal(CompletionSignal::resolved(EpochOutcome::Settled))
    }

    fn with_signal(signal: CompletionSignal) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            restarts: AtomicU64::new(0),
            finalized: AtomicUsize::new(0),
            latch: CancellationLatch::default(),
            signal,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn latch(&self) -> &CancellationLatch {
        &self.latch
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.latch.is_tripped()
    }

    pub(crate) fn note_restart(&self) -> u64 {
        self.restarts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }

    pub(crate) fn note_finalized(&self) {
        self.finalized.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::Acquire)
    }

    /// Resolves the completion signal. On the first resolution returns the
    /// record describing the epoch; afterwards returns `None`.
    pub fn resolve(&self, outcome: EpochOutcome) -> Option<EpochRecord> {
        if !self.signal.resolve(outcome.clone()) {
            return None;
        }
        Some(EpochRecord::new(
            self.id,
            outcome,
            self.restarts(),
            self.finalized(),
            self.started_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_trips_once() {
        let latch = CancellationLatch::default();
        assert!(!latch.is_tripped());
        assert!(latch.trip());
        assert!(!latch.trip());
        assert!(latch.is_tripped());
    }

    #[test]
    fn idle_epoch_is_already_settled() {
        let epoch = Epoch::idle();
        assert_eq!(epoch.signal().outcome(), Some(EpochOutcome::Settled));
        assert!(epoch.resolve(EpochOutcome::Cancelled).is_none());
    }

    #[test]
    fn resolve_produces_a_single_record() {
        let epoch = Epoch::begin();
        epoch.note_restart();
        epoch.note_restart();
        epoch.note_finalized();

        let record = epoch.resolve(EpochOutcome::Settled).unwrap();
        assert_eq!(record.epoch_id, epoch.id());
        assert_eq!(record.restarts, 2);
        assert_eq!(record.finalized, 1);
        assert_eq!(record.outcome, EpochOutcome::Settled);

        assert!(epoch.resolve(EpochOutcome::Cancelled).is_none());
        assert_eq!(epoch.signal().outcome(), Some(EpochOutcome::Settled));
    }

    #[test]
    fn epochs_get_distinct_ids() {
        assert_ne!(Epoch::begin().id(), Epoch::begin().id());
    }
}
