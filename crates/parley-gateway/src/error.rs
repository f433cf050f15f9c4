use parley_types::events::ErrorCode;
use thiserror::Error;

/// Failures of a single send, reported back to the sending connection only.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid message: {0}")]
    Validation(String),

    /// The store could not persist the message. Safe to retry with the same id.
    #[error("message store unavailable: {0:#}")]
    Store(anyhow::Error),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Store(_) => ErrorCode::Store,
        }
    }
}

/// Why a live push did not happen. Never surfaced to the sender: the message
/// is already stored and stays `sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("recipient offline")]
    Offline,

    #[error("recipient connection not writable")]
    Transport,
}
