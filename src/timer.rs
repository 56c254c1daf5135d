//! The restartable settle timer.
//!
//! [`SettleTimer`] fires once after its interval has elapsed since the most
//! recent restart, however many restarts happened. Every restart arms its own
//! wait and none is ever cancelled: when a wait elapses it compares the
//! counter snapshot it captured with the live [`VersionCounters`], and only
//! the wait that still matches goes on to settle the epoch.

use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{LateParticipationPolicy, SettleConfig};
use crate::epoch::{Epoch, EpochOutcome, EpochRecord, Snapshot, VersionCounters};
use crate::error::SettleError;
use crate::events::{Observers, SubscriptionId, TimerEvent};
use crate::finalize::FinalizingArgs;

/// Interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Runs once when an idle timer starts a new epoch.
pub type InitialAction = Arc<dyn Fn() + Send + Sync>;

/// Runs once when an epoch's winning wait elapses, with the epoch's payload.
pub type CompleteAction<P> = Arc<dyn Fn(Option<&P>) + Send + Sync>;

/// Arguments of one restart. Absent fields keep the epoch's current value.
pub struct RestartRequest<P> {
    initial: Option<InitialAction>,
    complete: Option<CompleteAction<P>>,
    payload: Option<P>,
}

impl<P> Default for RestartRequest<P> {
    fn default() -> Self {
        Self {
            initial: None,
            complete: None,
            payload: None,
        }
    }
}

impl<P> RestartRequest<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Used only if this restart starts a new epoch.
    pub fn initial<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.initial = Some(Arc::new(action));
        self
    }

    pub fn complete<F>(mut self, action: F) -> Self
    where
        F: Fn(Option<&P>) + Send + Sync + 'static,
    {
        self.complete = Some(Arc::new(action));
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }
}

struct Defaults<P> {
    initial: Option<InitialAction>,
    complete: Option<CompleteAction<P>>,
    payload: Option<P>,
}

// The current epoch and what it will run when it wins.
struct EpochSlot<P> {
    current: Arc<Epoch>,
    complete: Option<CompleteAction<P>>,
    payload: Option<P>,
}

// Low bit of the running word: the flag itself. The bits above count
// transitions, so two words only compare equal for the same transition.
const RUNNING_BIT: u64 = 1;

struct Inner<P> {
    counters: VersionCounters,
    interval_nanos: AtomicU64,
    // Written only under the slot lock.
    running: AtomicU64,
    // Last running word handed to observers.
    running_published: Mutex<u64>,
    // Guards idle→running, winning and cancel transitions. Never held while
    // user callbacks run.
    slot: Mutex<EpochSlot<P>>,
    defaults: Defaults<P>,
    observers: Observers,
    policy: LateParticipationPolicy,
    runtime: Handle,
    last_record: Mutex<Option<EpochRecord>>,
}

fn duration_to_nanos(interval: Duration) -> u64 {
    u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

impl<P> Inner<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn lock_slot(&self) -> MutexGuard<'_, EpochSlot<P>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) & RUNNING_BIT != 0
    }

    /// Sets the running flag and returns its previous value. The caller holds
    /// the slot lock.
    fn set_running(&self, running: bool) -> bool {
        let word = self.running.load(Ordering::Acquire);
        let was_running = word & RUNNING_BIT != 0;
        if was_running != running {
            let transitions = (word >> 1).wrapping_add(1);
            self.running
                .store((transitions << 1) | u64::from(running), Ordering::Release);
        }
        was_running
    }

    /// Tells observers about the latest running transition.
    ///
    /// Deliveries are serialized. A caller that finds another delivery in
    /// progress leaves its transition to that caller, which re-reads the word
    /// after releasing the lock. Observers therefore always end on the live
    /// value, though quick back-to-back transitions may be coalesced.
    fn publish_running(&self) {
        loop {
            let mut published = match self.running_published.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            let word = self.running.load(Ordering::Acquire);
            if word != *published {
                *published = word;
                self.observers.emit(&TimerEvent::RunningChanged {
                    running: word & RUNNING_BIT != 0,
                });
            }
            drop(published);
            if self.running.load(Ordering::Acquire) == word {
                return;
            }
        }
    }

    /// Resolves `epoch` and publishes its record, unless it already resolved.
    fn finish(&self, epoch: &Epoch, outcome: EpochOutcome) {
        // Held across the resolution so a woken waiter reads this record.
        let mut last_record = self
            .last_record
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(record) = epoch.resolve(outcome) else {
            return;
        };
        *last_record = Some(record.clone());
        drop(last_record);
        info!(
            epoch = %record.epoch_id,
            outcome = %record.outcome,
            restarts = record.restarts,
            finalized = record.finalized,
            duration_ms = record.duration_ms,
            "epoch resolved"
        );
        self.observers.emit(&TimerEvent::Resolved(record));
    }

    /// Body of the task armed by one restart.
    async fn expire(this: Weak<Self>, epoch: Arc<Epoch>, snapshot: Snapshot, interval: Duration) {
        sleep(interval).await;

        let Some(inner) = this.upgrade() else {
            // The timer is gone; nobody can settle this epoch any more.
            epoch.resolve(EpochOutcome::Cancelled);
            return;
        };
        if !inner.counters.is_current(snapshot) {
            trace!(epoch = %epoch.id(), start_count = snapshot.start_count, "stale wait discarded");
            return;
        }
        inner.settle(epoch, snapshot).await;
    }

    /// Runs the winning wait: complete action, finalization, resolution.
    async fn settle(&self, epoch: Arc<Epoch>, snapshot: Snapshot) {
        let (complete, payload) = {
            let slot = self.lock_slot();
            // A restart or cancel may have slipped in since the lock-free check.
            if !self.counters.is_current(snapshot) || !Arc::ptr_eq(&slot.current, &epoch) {
                trace!(epoch = %epoch.id(), "wait lost the race for the slot");
                return;
            }
            self.set_running(false);
            (slot.complete.clone(), slot.payload.clone())
        };

        let epoch_id = epoch.id();
        debug!(epoch = %epoch_id, restarts = epoch.restarts(), "epoch ran to completion");

        // A panicking user callback faults the epoch instead of unwinding the task.
        let prepared = panic::catch_unwind(AssertUnwindSafe(|| {
            self.publish_running();
            if let Some(complete) = complete {
                complete(payload.as_ref());
            }
            self.observers
                .emit(&TimerEvent::RanToCompletion { epoch: epoch_id });

            let mut args =
                FinalizingArgs::new(Arc::clone(&epoch), self.policy, self.runtime.clone());
            self.observers.finalizing(&mut args);
            args.seal()
        }));
        let pipeline = match prepared {
            Ok(pipeline) => pipeline,
            Err(panicked) => {
                let reason = format!(
                    "settlement callback panicked: {}",
                    panic_message(&*panicked)
                );
                warn!(epoch = %epoch_id, %reason, "epoch faulted before finalization");
                self.finish(&epoch, EpochOutcome::Faulted(reason));
                return;
            }
        };
        debug!(epoch = %epoch_id, items = pipeline.len(), "draining finalization queue");
        let outcome = pipeline.drain().await;
        self.finish(&epoch, outcome);
    }
}

/// A restartable timer that settles once activity has been quiet for its
/// interval.
///
/// Cloning yields another handle to the same timer. `P` is the payload type
/// handed to the complete action.
pub struct SettleTimer<P = ()> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for SettleTimer<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for SettleTimer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettleTimer")
            .field(
                "interval",
                &Duration::from_nanos(self.inner.interval_nanos.load(Ordering::Acquire)),
            )
            .field("running", &(self.inner.running.load(Ordering::Acquire) & RUNNING_BIT != 0))
            .field("counters", &self.inner.counters.snapshot())
            .finish()
    }
}

impl<P> SettleTimer<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// A timer with the default interval, bound to the current tokio runtime.
    pub fn new() -> Result<Self, SettleError> {
        Self::builder().build()
    }

    pub fn builder() -> SettleTimerBuilder<P> {
        SettleTimerBuilder::default()
    }

    /// A timer configured from a loaded [`SettleConfig`].
    pub fn from_config(config: &SettleConfig) -> Result<Self, SettleError> {
        Self::builder().config(config).build()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval()
    }

    /// Changes the interval. Waits that are already armed keep theirs.
    pub fn set_interval(&self, interval: Duration) {
        self.inner
            .interval_nanos
            .store(duration_to_nanos(interval), Ordering::Release);
    }

    /// Whether an epoch is collecting restarts.
    ///
    /// Turns `false` as soon as the winning wait claims the epoch, before the
    /// complete action runs and before the finalization queue drains. A
    /// restart from then on starts a new epoch. Await [`SettleTimer::settled`]
    /// to wait for the full boundary, finalization included.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Identifier of the current (or most recent) epoch.
    pub fn current_epoch(&self) -> Uuid {
        self.inner.lock_slot().current.id()
    }

    /// Record of the most recently resolved epoch.
    pub fn last_record(&self) -> Option<EpochRecord> {
        self.inner
            .last_record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn start_or_restart(&self) {
        self.restart(RestartRequest::new());
    }

    pub fn start_or_restart_with<F>(&self, complete: F)
    where
        F: Fn(Option<&P>) + Send + Sync + 'static,
    {
        self.restart(RestartRequest::new().complete(complete));
    }

    pub fn start_or_restart_with_actions<I, F>(&self, initial: I, complete: F)
    where
        I: Fn() + Send + Sync + 'static,
        F: Fn(Option<&P>) + Send + Sync + 'static,
    {
        self.restart(RestartRequest::new().initial(initial).complete(complete));
    }

    pub fn start_or_restart_with_payload(&self, payload: P) {
        self.restart(RestartRequest::new().payload(payload));
    }

    /// Starts an epoch if idle, then arms a fresh wait of the current interval.
    ///
    /// Never blocks. A complete action or payload in `request` replaces the
    /// epoch's current one; the initial action only runs when this call starts
    /// the epoch.
    pub fn restart(&self, request: RestartRequest<P>) {
        let RestartRequest {
            initial,
            complete,
            payload,
        } = request;
        let inner = &self.inner;

        let (epoch, snapshot, started) = {
            let mut slot = inner.lock_slot();
            let started = !inner.set_running(true);
            if started {
                slot.current = Arc::new(Epoch::begin());
                slot.complete = inner.defaults.complete.clone();
                slot.payload = inner.defaults.payload.clone();
            }
            if let Some(complete) = complete {
                slot.complete = Some(complete);
            }
            if let Some(payload) = payload {
                slot.payload = Some(payload);
            }
            slot.current.note_restart();
            (Arc::clone(&slot.current), inner.counters.arm(), started)
        };

        let interval = inner.interval();
        if started {
            debug!(epoch = %epoch.id(), ?interval, "epoch started");
            inner.publish_running();
            if let Some(initial) = initial.or_else(|| inner.defaults.initial.clone()) {
                initial();
            }
            inner
                .observers
                .emit(&TimerEvent::Initialized { epoch: epoch.id() });
        }

        trace!(epoch = %epoch.id(), start_count = snapshot.start_count, ?interval, "wait armed");
        inner
            .runtime
            .spawn(Inner::expire(Arc::downgrade(inner), epoch, snapshot, interval));
    }

    /// Cancels the current epoch.
    ///
    /// Every armed wait becomes stale, the completion signal resolves as
    /// [`EpochOutcome::Cancelled`] right away and no further finalization work
    /// of the epoch starts. Never fails.
    pub fn cancel(&self) {
        let inner = &self.inner;
        let (epoch, was_running) = {
            let slot = inner.lock_slot();
            inner.counters.cancel();
            (Arc::clone(&slot.current), inner.set_running(false))
        };
        epoch.latch().trip();
        debug!(epoch = %epoch.id(), was_running, "epoch cancelled");

        if was_running {
            inner.publish_running();
        }
        inner
            .observers
            .emit(&TimerEvent::Cancelled { epoch: epoch.id() });
        inner.finish(&epoch, EpochOutcome::Cancelled);
    }

    /// Waits for the current epoch to resolve.
    ///
    /// The epoch is captured when this is called: an idle timer returns the
    /// outcome of its last epoch (`Settled` if there never was one) at once.
    pub fn settled(&self) -> impl Future<Output = EpochOutcome> + Send + use<P> {
        let signal = self.inner.lock_slot().current.signal().clone();
        async move { signal.wait().await }
    }

    /// Observes every [`TimerEvent`], in subscription order.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&TimerEvent) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(Arc::new(observer))
    }

    /// Handles the finalizing notification of every winning epoch.
    ///
    /// Work must be queued on the [`FinalizingArgs`] before the handler
    /// returns; it is then awaited, in order, before the epoch settles.
    pub fn on_finalizing<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&mut FinalizingArgs) + Send + Sync + 'static,
    {
        self.inner.observers.on_finalizing(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }
}

impl<P> IntoFuture for &SettleTimer<P>
where
    P: Clone + Send + Sync + 'static,
{
    type Output = EpochOutcome;
    type IntoFuture = Pin<Box<dyn Future<Output = EpochOutcome> + Send + 'static>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.settled())
    }
}

/// Builder for [`SettleTimer`].
pub struct SettleTimerBuilder<P> {
    interval: Duration,
    initial: Option<InitialAction>,
    complete: Option<CompleteAction<P>>,
    payload: Option<P>,
    policy: LateParticipationPolicy,
    runtime: Option<Handle>,
}

impl<P> Default for SettleTimerBuilder<P> {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            initial: None,
            complete: None,
            payload: None,
            policy: LateParticipationPolicy::default(),
            runtime: None,
        }
    }
}

impl<P> SettleTimerBuilder<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Initial action used by epochs whose starting restart supplies none.
    pub fn initial_action<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.initial = Some(Arc::new(action));
        self
    }

    /// Complete action every epoch starts with.
    pub fn complete_action<F>(mut self, action: F) -> Self
    where
        F: Fn(Option<&P>) + Send + Sync + 'static,
    {
        self.complete = Some(Arc::new(action));
        self
    }

    /// Payload every epoch starts with.
    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn late_participation(mut self, policy: LateParticipationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runtime on which waits and finalization run. Defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Applies the interval and late-participation policy of `config`.
    pub fn config(self, config: &SettleConfig) -> Self {
        self.interval(config.interval())
            .late_participation(config.late_participation)
    }

    pub fn build(self) -> Result<SettleTimer<P>, SettleError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| SettleError::NoRuntime)?,
        };

        Ok(SettleTimer {
            inner: Arc::new(Inner {
                counters: VersionCounters::new(),
                interval_nanos: AtomicU64::new(duration_to_nanos(self.interval)),
                running: AtomicU64::new(0),
                running_published: Mutex::new(0),
                slot: Mutex::new(EpochSlot {
                    current: Arc::new(Epoch::idle()),
                    complete: None,
                    payload: None,
                }),
                defaults: Defaults {
                    initial: self.initial,
                    complete: self.complete,
                    payload: self.payload,
                },
                observers: Observers::default(),
                policy: self.policy,
                runtime,
                last_record: Mutex::new(None),
            }),
        })
    }
}
