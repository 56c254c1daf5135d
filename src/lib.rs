//! Restartable settle timer.
//!
//! A [`SettleTimer`] coalesces bursts of restarts into a single completion
//! that fires once its interval has passed without another restart. Each
//! settlement cycle (an *epoch*) can be awaited, and subscribers can extend it
//! with ordered asynchronous finalization work through
//! [`SettleTimer::on_finalizing`].
//!
//! ```no_run
//! use std::time::Duration;
//! use settle::{EpochOutcome, SettleTimer};
//!
//! # async fn demo() -> Result<(), settle::SettleError> {
//! let timer = SettleTimer::<String>::builder()
//!     .interval(Duration::from_millis(300))
//!     .build()?;
//! timer.on_finalizing(|args| {
//!     args.add(|| async {
//!         // Run the query for the settled input here.
//!         Ok(())
//!     });
//! });
//!
//! for text in ["r", "ru", "rus", "rust"] {
//!     timer.start_or_restart_with_payload(text.to_string());
//! }
//! assert_eq!(timer.settled().await, EpochOutcome::Settled);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod epoch;
pub mod error;
pub mod events;
pub mod finalize;
pub mod timer;

pub use config::{LateParticipationPolicy, SettleConfig};
pub use epoch::{EpochOutcome, EpochRecord};
pub use error::{FinalizeError, SettleError};
pub use events::{SubscriptionId, TimerEvent};
pub use finalize::{FinalizeResult, FinalizingArgs, Participant};
pub use timer::{
    CompleteAction, DEFAULT_INTERVAL, InitialAction, RestartRequest, SettleTimer,
    SettleTimerBuilder,
};
