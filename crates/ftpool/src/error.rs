//! Error taxonomy for sessions, connection creation and the pool.

use std::fmt;
use std::time::Duration;

use ftpool_core::ConfigError;
use thiserror::Error;

use crate::pool::PoolState;

/// Step of connection creation that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectPhase {
    Resolve,
    Connect,
    Proxy,
    TlsSetup,
    TlsHandshake,
    Greeting,
    Authenticate,
    DataMode,
    Configure,
    Validate,
    Transfer,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectPhase::Resolve => "dns resolution",
            ConnectPhase::Connect => "tcp connect",
            ConnectPhase::Proxy => "proxy tunnel",
            ConnectPhase::TlsSetup => "tls setup",
            ConnectPhase::TlsHandshake => "tls handshake",
            ConnectPhase::Greeting => "server greeting",
            ConnectPhase::Authenticate => "authentication",
            ConnectPhase::DataMode => "data mode negotiation",
            ConnectPhase::Configure => "session configuration",
            ConnectPhase::Validate => "validation",
            ConnectPhase::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// Connection creation (or use) failed during `phase`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{phase} failed: {message}")]
pub struct ConnectError {
    pub phase: ConnectPhase,
    pub message: String,
}

impl ConnectError {
    pub fn new(phase: ConnectPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }

    /// Whether retrying later may succeed. Configuration-shaped failures
    /// (bad credentials, TLS mismatch, refused data mode) are not transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.phase,
            ConnectPhase::Resolve
                | ConnectPhase::Connect
                | ConnectPhase::Proxy
                | ConnectPhase::Greeting
                | ConnectPhase::Validate
                | ConnectPhase::Transfer
        )
    }
}

/// Failure of a single operation on an FTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server replied {code}: {text}")]
    Reply { code: u16, text: String },
}

impl SessionError {
    /// `true` when the session can no longer be trusted. A server refusal
    /// (`Reply`) leaves the control channel usable.
    pub fn is_transport(&self) -> bool {
        !matches!(self, SessionError::Reply { .. })
    }

    pub fn reply_code(&self) -> Option<u16> {
        match self {
            SessionError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn into_connect(self, phase: ConnectPhase) -> ConnectError {
        ConnectError::new(phase, self.to_string())
    }
}

/// Errors surfaced to pool and service callers.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("connection pool exhausted: {max_total} connections in use (waited {waited:?})")]
    Exhausted { max_total: usize, waited: Duration },

    #[error("connection pool is {0}")]
    State(PoolState),

    #[error("{command} rejected by server ({code}): {text}")]
    Rejected {
        command: &'static str,
        code: u16,
        text: String,
    },

    #[error("unknown connection handle: {0}")]
    UnknownHandle(u64),
}

impl PoolError {
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::Connect(e) => e.is_transient(),
            PoolError::Exhausted { .. } => true,
            _ => false,
        }
    }
}
