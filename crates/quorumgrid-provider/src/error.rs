//! Provider tracker error types.

use thiserror::Error;

/// Errors returned by the provider tracker.
///
/// `Clone` so that every waiter on a shared construction receives the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The request is not valid for this tracker's mode.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The tracker has been stopped.
    #[error("provider tracker dying")]
    Dying,

    /// Building the provider failed. Not cached; the next call retries.
    #[error("building provider for {namespace}: {message}")]
    Build { namespace: String, message: String },
}

impl TrackerError {
    pub fn is_dying(&self) -> bool {
        matches!(self, TrackerError::Dying)
    }

    pub(crate) fn build(namespace: &str, err: &anyhow::Error) -> Self {
        TrackerError::Build {
            namespace: namespace.to_string(),
            message: format!("{err:#}"),
        }
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
