use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome of one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum EpochOutcome {
    /// The quiet interval elapsed and every finalization item completed.
    Settled,
    /// `cancel` was called, or a finalization item gave up cooperatively.
    Cancelled,
    /// A finalization item failed.
    Faulted(String),
}

impl EpochOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, EpochOutcome::Settled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EpochOutcome::Cancelled)
    }
}

impl fmt::Display for EpochOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochOutcome::Settled => write!(f, "settled"),
            EpochOutcome::Cancelled => write!(f, "cancelled"),
            EpochOutcome::Faulted(reason) => write!(f, "faulted: {reason}"),
        }
    }
}

/// Summary produced when an epoch resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch_id: Uuid,
    pub outcome: EpochOutcome,
    /// Restart requests coalesced into this epoch.
    pub restarts: u64,
    /// Finalization items that ran to completion.
    pub finalized: usize,
    pub started_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl EpochRecord {
    pub(crate) fn new(
        epoch_id: Uuid,
        outcome: EpochOutcome,
        restarts: u64,
        finalized: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            epoch_id,
            outcome,
            restarts,
            finalized,
            started_at,
            resolved_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display() {
        assert_eq!(EpochOutcome::Settled.to_string(), "settled");
        assert_eq!(EpochOutcome::Cancelled.to_string(), "cancelled");
        assert_eq!(
            EpochOutcome::Faulted("query failed".into()).to_string(),
            "faulted: query failed"
        );
    }

    #[test]
    fn outcome_predicates() {
        assert!(EpochOutcome::Settled.is_settled());
        assert!(!EpochOutcome::Settled.is_cancelled());
        assert!(EpochOutcome::Cancelled.is_cancelled());
        assert!(!EpochOutcome::Faulted("x".into()).is_settled());
        assert!(!EpochOutcome::Faulted("x".into()).is_cancelled());
    }

    #[test]
    fn record_measures_duration_from_start() {
        let started_at = Utc::now() - chrono::Duration::milliseconds(300);
        let record = EpochRecord::new(Uuid::new_v4(), EpochOutcome::Settled, 4, 2, started_at);
        assert!(record.duration_ms >= 300);
        assert_eq!(record.restarts, 4);
        assert_eq!(record.finalized, 2);
    }

    #[test]
    fn record_json_shape() {
        let record = EpochRecord::new(
            Uuid::nil(),
            EpochOutcome::Faulted("boom".into()),
            1,
            0,
            Utc::now(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"]["outcome"], "faulted");
        assert_eq!(json["outcome"]["reason"], "boom");
        assert_eq!(json["restarts"], 1);
    }
}
