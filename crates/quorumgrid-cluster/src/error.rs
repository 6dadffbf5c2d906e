//! Cluster bootstrap error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while preparing a node to join the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No suitable local address exists for binding or advertising.
    #[error("not found: {0}")]
    NotFound(String),

    /// The node lacks the credentials required for the request.
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("listing network interfaces: {0}")]
    Interfaces(String),

    #[error("tls config error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("address error: {0}")]
    Address(#[from] quorum_core::AddressError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure while building a named cluster option.
    #[error("building {option} option: {source}")]
    Option {
        option: &'static str,
        #[source]
        source: Box<ClusterError>,
    },
}

impl ClusterError {
    /// Annotate an error with the option being built.
    pub fn in_option(self, option: &'static str) -> Self {
        ClusterError::Option {
            option,
            source: Box::new(self),
        }
    }

    /// Whether the root cause is [`ClusterError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        match self {
            ClusterError::NotFound(_) => true,
            ClusterError::Option { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the root cause is [`ClusterError::NotSupported`].
    pub fn is_not_supported(&self) -> bool {
        match self {
            ClusterError::NotSupported(_) => true,
            ClusterError::Option { source, .. } => source.is_not_supported(),
            _ => false,
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
