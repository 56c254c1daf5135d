use std::sync::Arc;

use tokio::sync::watch;

use super::record::EpochOutcome;

/// Single-resolution, multi-waiter completion boundary of one epoch.
///
/// Clones share the same underlying state. The first call to
/// [`resolve`](CompletionSignal::resolve) wins; later calls are ignored.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    tx: Arc<watch::Sender<Option<EpochOutcome>>>,
}

impl CompletionSignal {
    /// A signal that has not resolved yet.
    pub fn pending() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A signal already resolved with `outcome`.
    pub fn resolved(outcome: EpochOutcome) -> Self {
        let (tx, _rx) = watch::channel(Some(outcome));
        Self { tx: Arc::new(tx) }
    }

    /// Resolves the signal. Returns `false` if it was already resolved.
    pub fn resolve(&self, outcome: EpochOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// The outcome, if the signal has resolved.
    pub fn outcome(&self) -> Option<EpochOutcome> {
        self.tx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits for the outcome. Returns immediately if already resolved.
    pub async fn wait(&self) -> EpochOutcome {
        let mut rx = self.tx.subscribe();
        let resolved = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        // `self` keeps the sender alive, so the channel cannot close under us.
        resolved.unwrap_or(EpochOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolved_signal_returns_immediately() {
        let signal = CompletionSignal::resolved(EpochOutcome::Settled);
        assert!(signal.is_resolved());
        assert_eq!(signal.wait().await, EpochOutcome::Settled);
    }

    #[test]
    fn only_first_resolution_counts() {
        let signal = CompletionSignal::pending();
        assert!(signal.outcome().is_none());
        assert!(signal.resolve(EpochOutcome::Cancelled));
        assert!(!signal.resolve(EpochOutcome::Settled));
        assert_eq!(signal.outcome(), Some(EpochOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn all_waiters_wake_on_resolution() {
        let signal = CompletionSignal::pending();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.resolve(EpochOutcome::Faulted("boom".into()));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), EpochOutcome::Faulted("boom".into()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_attached_after_resolution_sees_outcome() {
        let signal = CompletionSignal::pending();
        signal.resolve(EpochOutcome::Settled);
        let late = signal.clone();
        assert_eq!(late.wait().await, EpochOutcome::Settled);
    }
}
