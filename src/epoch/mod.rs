mod counters;
mod record;
mod signal;
mod state;

pub use counters::{Snapshot, VersionCounters};
pub use record::{EpochOutcome, EpochRecord};
pub use signal::CompletionSignal;
pub use state::{CancellationLatch, Epoch};
