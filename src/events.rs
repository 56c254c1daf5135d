//! Notifications raised by the timer.
//!
//! Observers are plain callbacks invoked synchronously, in subscription
//! order, on the thread that caused the notification. The lists are copied
//! before delivery, so an observer may subscribe, unsubscribe or restart the
//! timer from inside a callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::epoch::EpochRecord;
use crate::finalize::FinalizingArgs;

/// Something observable happened to the timer.
#[derive(Debug, Clone)]
pub enum TimerEvent {
    /// An idle timer started a new epoch.
    Initialized { epoch: Uuid },
    /// The winning wait elapsed and the complete action ran.
    RanToCompletion { epoch: Uuid },
    /// `cancel` was called.
    Cancelled { epoch: Uuid },
    /// The running state flipped. Notifications are delivered one at a time
    /// and the last one always matches the live state; transitions racing
    /// with a delivery may be folded into a single notification.
    RunningChanged { running: bool },
    /// An epoch's completion signal resolved.
    Resolved(EpochRecord),
}

impl fmt::Display for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerEvent::Initialized { epoch } => write!(f, "initialized {epoch}"),
            TimerEvent::RanToCompletion { epoch } => write!(f, "ran to completion {epoch}"),
            TimerEvent::Cancelled { epoch } => write!(f, "cancelled {epoch}"),
            TimerEvent::RunningChanged { running } => write!(f, "running = {running}"),
            TimerEvent::Resolved(record) => {
                write!(f, "resolved {} ({})", record.epoch_id, record.outcome)
            }
        }
    }
}

/// Token returned by `subscribe` and `on_finalizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Observer = Arc<dyn Fn(&TimerEvent) + Send + Sync>;
pub type FinalizingHandler = Arc<dyn Fn(&mut FinalizingArgs) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    events: RwLock<Vec<(SubscriptionId, Observer)>>,
    finalizing: RwLock<Vec<(SubscriptionId, FinalizingHandler)>>,
}

impl Observers {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn subscribe(&self, observer: Observer) -> SubscriptionId {
        let id = self.next_id();
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub(crate) fn on_finalizing(&self, handler: FinalizingHandler) -> SubscriptionId {
        let id = self.next_id();
        self.finalizing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Removes an observer or finalizing handler. Returns `false` if unknown.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let before = events.len();
        events.retain(|(existing, _)| *existing != id);
        if events.len() != before {
            return true;
        }
        drop(events);

        let mut finalizing = self
            .finalizing
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = finalizing.len();
        finalizing.retain(|(existing, _)| *existing != id);
        finalizing.len() != before
    }

    pub(crate) fn emit(&self, event: &TimerEvent) {
        let observers: Vec<Observer> = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    pub(crate) fn finalizing(&self, args: &mut FinalizingArgs) {
        let handlers: Vec<FinalizingHandler> = self
            .finalizing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(args);
        }
    }
}
