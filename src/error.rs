use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No tokio runtime available. Build the timer inside a runtime or pass a handle.")]
    NoRuntime,

    #[error("Finalization work for epoch {epoch} was registered after the finalizing window closed")]
    LateParticipation { epoch: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure reported by a finalization work item.
///
/// The two variants map onto different epoch outcomes: cooperative
/// cancellation ends the epoch as `Cancelled`, anything else as `Faulted`.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The work item gave up cooperatively.
    #[error("finalization cancelled")]
    Cancelled,

    /// The work item failed.
    #[error("finalization failed: {0:#}")]
    Failed(#[from] anyhow::Error),
}

impl FinalizeError {
    /// Shorthand for an ordinary failure carrying a message.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        FinalizeError::Failed(anyhow::anyhow!("{message}"))
    }
}
