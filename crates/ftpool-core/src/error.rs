//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

/// An invalid or unreadable connection configuration.
///
/// Raised by [`ConnectionConfigBuilder::build`](crate::ConnectionConfigBuilder::build)
/// and the config file loaders. A configuration error never reaches the pool.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("implicit and explicit TLS cannot both be enabled")]
    ConflictingTls,

    #[error("invalid data channel mode: {0}")]
    DataMode(String),

    #[error("invalid pool sizing: {0}")]
    PoolSizing(String),

    #[error("unknown control channel encoding: {0}")]
    UnknownEncoding(String),

    #[error("unknown TLS protocol version: {0}")]
    UnknownTlsVersion(String),

    #[error("unknown or unsupported cipher suite: {0}")]
    UnknownCipherSuite(String),

    #[error("unusable trust store {path}: {reason}")]
    TrustStore { path: PathBuf, reason: String },

    #[error("invalid duration: {0}")]
    Duration(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
