//! Error types for QuorumGrid core parsing.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating an agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse agent config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render agent config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid agent config: {0}")]
    Invalid(String),
}

/// Errors raised while splitting a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),

    #[error("invalid port in address {0:?}")]
    InvalidPort(String),

    #[error("empty host in address {0:?}")]
    EmptyHost(String),
}
