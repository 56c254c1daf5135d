//! Ordered asynchronous finalization of a winning epoch.
//!
//! When an epoch wins, the timer raises one synchronous "finalizing"
//! notification carrying a [`FinalizingArgs`]. Handlers queue work items on
//! it; once every handler has returned the queue is sealed and the
//! [`FinalizationPipeline`] runs the items one at a time, in the order they
//! were queued, before the epoch's completion signal resolves.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LateParticipationPolicy;
use crate::epoch::{Epoch, EpochOutcome};
use crate::error::{FinalizeError, SettleError};

/// Result of one finalization work item.
pub type FinalizeResult = Result<(), FinalizeError>;

type WorkFuture = Pin<Box<dyn Future<Output = FinalizeResult> + Send>>;
type WorkItem = Box<dyn FnOnce() -> WorkFuture + Send>;

fn boxed<F, Fut>(work: F) -> WorkItem
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = FinalizeResult> + Send + 'static,
{
    Box::new(move || Box::pin(work()) as WorkFuture)
}

#[derive(Default)]
struct QueueState {
    sealed: bool,
    items: VecDeque<WorkItem>,
}

type SharedQueue = Arc<Mutex<QueueState>>;

/// Handle for queueing finalization work on one epoch.
///
/// Obtained from [`FinalizingArgs::participant`]. It can be kept past the
/// finalizing notification, but work added after the notification returned
/// is not part of the epoch: [`add`](Participant::add) reports
/// [`SettleError::LateParticipation`].
#[derive(Clone)]
pub struct Participant {
    epoch: Arc<Epoch>,
    queue: SharedQueue,
    policy: LateParticipationPolicy,
    runtime: Handle,
}

impl Participant {
    pub fn epoch_id(&self) -> Uuid {
        self.epoch.id()
    }

    /// True once `cancel` has been called for this epoch.
    pub fn is_cancelled(&self) -> bool {
        self.epoch.is_cancelled()
    }

    /// Queues `work` if the finalizing window is still open.
    ///
    /// After the window closed the work is either run detached from the
    /// epoch or dropped, depending on the configured
    /// [`LateParticipationPolicy`], and an error is returned in both cases.
    pub fn add<F, Fut>(&self, work: F) -> Result<(), SettleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FinalizeResult> + Send + 'static,
    {
        let item = boxed(work);
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if !queue.sealed {
                queue.items.push_back(item);
                return Ok(());
            }
        }

        let epoch = self.epoch.id();
        warn!(%epoch, policy = %self.policy, "finalization work registered after the finalizing window closed");
        if self.policy == LateParticipationPolicy::Detach {
            self.runtime.spawn(async move {
                if let Err(error) = item().await {
                    warn!(%epoch, %error, "detached finalization work failed");
                }
            });
        }
        Err(SettleError::LateParticipation { epoch })
    }
}

/// Argument of the "finalizing" notification.
///
/// Only lives for the duration of the notification. Everything queued on it
/// is awaited, in order, before the epoch is reported settled.
pub struct FinalizingArgs {
    participant: Participant,
}

impl FinalizingArgs {
    pub(crate) fn new(epoch: Arc<Epoch>, policy: LateParticipationPolicy, runtime: Handle) -> Self {
        Self {
            participant: Participant {
                epoch,
                queue: SharedQueue::default(),
                policy,
                runtime,
            },
        }
    }

    pub fn epoch_id(&self) -> Uuid {
        self.participant.epoch_id()
    }

    /// True once `cancel` has been called for this epoch.
    pub fn is_cancelled(&self) -> bool {
        self.participant.is_cancelled()
    }

    /// Queues a work item. `work` is called when the item's turn comes.
    pub fn add<F, Fut>(&mut self, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FinalizeResult> + Send + 'static,
    {
        let mut queue = self
            .participant
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.items.push_back(boxed(work));
    }

    /// Number of items queued so far.
    pub fn len(&self) -> usize {
        self.participant
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle that outlives the notification. See [`Participant`].
    pub fn participant(&self) -> Participant {
        self.participant.clone()
    }

    /// Closes the window and hands the queued items to a pipeline.
    pub(crate) fn seal(self) -> FinalizationPipeline {
        let items = {
            let mut queue = self
                .participant
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.sealed = true;
            std::mem::take(&mut queue.items)
        };
        FinalizationPipeline {
            epoch: self.participant.epoch,
            items,
            runtime: self.participant.runtime,
        }
    }
}

/// Sealed, ordered finalization work of one epoch.
pub(crate) struct FinalizationPipeline {
    epoch: Arc<Epoch>,
    items: VecDeque<WorkItem>,
    runtime: Handle,
}

impl FinalizationPipeline {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Runs every item to completion, one after the other.
    ///
    /// Stops at the first item that is cancelled or fails, and before the
    /// next item whenever the epoch's latch has been tripped.
    pub(crate) async fn drain(self) -> EpochOutcome {
        let epoch = self.epoch.id();
        let total = self.items.len();

        for (index, item) in self.items.into_iter().enumerate() {
            if self.epoch.is_cancelled() {
                debug!(%epoch, abandoned = total - index, "epoch cancelled during finalization");
                return EpochOutcome::Cancelled;
            }

            // Each item runs as its own task so a panic is reported as a fault.
            let joined = self.runtime.spawn(async move { item().await }).await;
            match joined {
                Ok(Ok(())) => self.epoch.note_finalized(),
                Ok(Err(FinalizeError::Cancelled)) => {
                    debug!(%epoch, index, abandoned = total - index - 1, "finalization item cancelled");
                    return EpochOutcome::Cancelled;
                }
                Ok(Err(FinalizeError::Failed(error))) => {
                    warn!(%epoch, index, abandoned = total - index - 1, "finalization item failed: {error:#}");
                    return EpochOutcome::Faulted(format!("{error:#}"));
                }
                Err(join) if join.is_panic() => {
                    warn!(%epoch, index, "finalization item panicked");
                    return EpochOutcome::Faulted(format!("finalization item {index} panicked"));
                }
                Err(_) => {
                    // Aborted by runtime shutdown.
                    return EpochOutcome::Cancelled;
                }
            }
        }

        if self.epoch.is_cancelled() {
            EpochOutcome::Cancelled
        } else {
            EpochOutcome::Settled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn args_for(epoch: &Arc<Epoch>, policy: LateParticipationPolicy) -> FinalizingArgs {
        FinalizingArgs::new(Arc::clone(epoch), policy, Handle::current())
    }

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) {
        log.lock().unwrap().push(name);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_in_registration_order() {
        let epoch = Arc::new(Epoch::begin());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut args = args_for(&epoch, LateParticipationPolicy::Detach);

        // Earlier items take longer, so any overlap would reorder the log.
        for (name, delay) in [("a", 30), ("b", 20), ("c", 10)] {
            let log = Arc::clone(&log);
            args.add(move || async move {
                sleep(Duration::from_millis(delay)).await;
                record(&log, name);
                Ok(())
            });
        }
        assert_eq!(args.len(), 3);

        let start = Instant::now();
        let outcome = args.seal().drain().await;
        assert_eq!(outcome, EpochOutcome::Settled);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(epoch.finalized(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pipeline_settles() {
        let epoch = Arc::new(Epoch::begin());
        let args = args_for(&epoch, LateParticipationPolicy::Detach);
        assert!(args.is_empty());
        let pipeline = args.seal();
        assert_eq!(pipeline.len(), 0);
        assert_eq!(pipeline.drain().await, EpochOutcome::Settled);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_faults_and_abandons_the_rest() {
        let epoch = Arc::new(Epoch::begin());
        let ran = Arc::new(AtomicUsize::new(0));
        let mut args = args_for(&epoch, LateParticipationPolicy::Detach);

        args.add(|| async { Err(FinalizeError::failed("query failed")) });
        let counter = Arc::clone(&ran);
        args.add(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcome = args.seal().drain().await;
        assert_eq!(outcome, EpochOutcome::Faulted("query failed".into()));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_cancellation_is_an_outcome_not_a_fault() {
        let epoch = Arc::new(Epoch::begin());
        let mut args = args_for(&epoch, LateParticipationPolicy::Detach);
        args.add(|| async { Ok(()) });
        args.add(|| async { Err(FinalizeError::Cancelled) });
        args.add(|| async { Err(FinalizeError::failed("never reached")) });

        assert_eq!(args.seal().drain().await, EpochOutcome::Cancelled);
        assert_eq!(epoch.finalized(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_item_faults() {
        let epoch = Arc::new(Epoch::begin());
        let mut args = args_for(&epoch, LateParticipationPolicy::Detach);
        let explode = true;
        args.add(move || async move {
            if explode {
                panic!("bad item");
            }
            Ok(())
        });

        let outcome = args.seal().drain().await;
        assert!(matches!(outcome, EpochOutcome::Faulted(reason) if reason.contains("panicked")));
    }

    #[tokio::test(start_paused = true)]
    async fn tripped_latch_stops_before_next_item() {
        let epoch = Arc::new(Epoch::begin());
        let ran = Arc::new(AtomicUsize::new(0));
        let mut args = args_for(&epoch, LateParticipationPolicy::Detach);

        let first_epoch = Arc::clone(&epoch);
        args.add(move || async move {
            first_epoch.latch().trip();
            Ok(())
        });
        let counter = Arc::clone(&ran);
        args.add(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(args.seal().drain().await, EpochOutcome::Cancelled);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn participant_joins_while_window_is_open() {
        let epoch = Arc::new(Epoch::begin());
        let mut args = args_for(&epoch, LateParticipationPolicy::Detach);
        let participant = args.participant();

        participant.add(|| async { Ok(()) }).unwrap();
        args.add(|| async { Ok(()) });
        assert_eq!(args.len(), 2);
        assert_eq!(participant.epoch_id(), epoch.id());
    }

    #[tokio::test(start_paused = true)]
    async fn late_participation_detaches_work() {
        let epoch = Arc::new(Epoch::begin());
        let ran = Arc::new(AtomicUsize::new(0));
        let args = args_for(&epoch, LateParticipationPolicy::Detach);
        let participant = args.participant();
        let pipeline = args.seal();

        let counter = Arc::clone(&ran);
        let err = participant
            .add(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SettleError::LateParticipation { epoch: id } if id == epoch.id()));

        assert_eq!(pipeline.drain().await, EpochOutcome::Settled);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // Detached work does not count towards the epoch.
        assert_eq!(epoch.finalized(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_participation_reject_drops_work() {
        let epoch = Arc::new(Epoch::begin());
        let ran = Arc::new(AtomicUsize::new(0));
        let args = args_for(&epoch, LateParticipationPolicy::Reject);
        let participant = args.participant();
        let _pipeline = args.seal();

        let counter = Arc::clone(&ran);
        assert!(participant
            .add(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .is_err());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
