use std::sync::PoisonError;

use thiserror::Error;

/// Errors surfaced by the repository and the initialization path.
///
/// Evaluation itself never fails: cycle and gating prerequisite outcomes are
/// encoded in [`crate::model::Source`], not here. The enum is `Clone` so a
/// stored first-fetch failure can be handed to every initialization waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("feature fetch failed: {0}")]
    Fetch(String),

    #[error("feature decryption failed: {0}")]
    Decryption(String),

    #[error("initialization timed out")]
    InitializationTimeout,

    #[error("repository has been shut down")]
    Shutdown,
}

impl<T> From<PoisonError<T>> for Error {
    fn from(e: PoisonError<T>) -> Self {
        Error::Fetch(format!("repository lock poisoned: {}", e))
    }
}
